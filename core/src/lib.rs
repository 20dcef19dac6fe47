pub mod config;
pub mod errors;
pub mod record;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use config::IngestConfig;
pub use errors::{BoxError, ConsumerError, ListenerError, ShutdownError, SinkError};
pub use record::{Record, Tag};
pub use shutdown::{Closer, ShutdownAggregator};
pub use sink::{JsonLinesSink, MemorySink, Sink, forward_records};
pub use source::QueueMessage;
pub use source::consumer::{ConsumerCoordinator, ConsumerGroupClient, GroupHandler, GroupSession};
pub use source::flow::{FlowDecoder, IpfixDecoder, NetflowV5Decoder};
pub use source::listener::{FlowListener, ListenerRegistry, ListenerState};
