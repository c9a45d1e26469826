//! Orders
//!
//! Order requests, the order aggregate and its state machine. Orders are
//! created locally by `OrderManager`; every later status change is driven by
//! broker events through `EventDispatcher`.

mod aggregate;
mod errors;
mod request;
mod value_objects;

pub use aggregate::Order;
pub use errors::OrderError;
pub use request::{OrderChanges, OrderRequest};
pub use value_objects::{OrderId, OrderStatus, OrderType, Side};
