// Trigger modules: adapters from external event sources (HTTP requests,
// broker topics, cron fires) into pipeline and state-machine dispatch.

pub mod broker;
pub mod cron;
pub mod http;
pub mod routes;
pub mod topic;

pub use broker::{BrokerModule, InProcessBroker};
pub use cron::CronTriggerModule;
pub use http::HttpTriggerModule;
pub use routes::RouteCollector;
pub use topic::TopicTriggerModule;
