//! Ordered handler dispatch against the user record store.

mod context;
mod dispatcher;
mod store;

pub use context::{ContractInfo, ContractReader, HandlerContext, NetworkInfo};
pub use dispatcher::{Dispatcher, ErrorPolicy, Handler, HandlerRegistry};
pub use store::{
    Condition, Direction, FindMany, MemoryRecordStore, RecordStore, RecordTransaction, UpdateData,
    Where,
};
