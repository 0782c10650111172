//! External collaborators of the rate limiter: the durable counter store and
//! the partitioned stream transport.
//!
//! Both are expressed as traits so the serving path and the aggregator can be
//! wired against Redis in production and against the in-memory
//! implementations in single-process mode and tests.

pub mod counter;
pub mod stream;

pub use counter::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use stream::{
    partition_for, Batch, DeliveredMessage, MemoryStream, RedisStream, RedisStreamConsumer,
    StreamConsumer, StreamPublisher, StreamRecord,
};
