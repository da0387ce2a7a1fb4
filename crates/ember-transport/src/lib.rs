pub mod connection;
pub mod dispatcher;

pub use connection::{Connection, TransportConfig};
pub use dispatcher::{Dispatcher, Subscription, SubscriptionFilter};
