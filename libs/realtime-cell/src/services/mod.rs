pub mod transport;
pub mod query;
pub mod poller;
pub mod registry;
pub mod phoenix;
pub mod live_rows;

pub use transport::*;
pub use query::*;
pub use poller::*;
pub use registry::*;
pub use phoenix::*;
pub use live_rows::*;
