pub mod protocol;
pub mod receiver;
pub mod sender;

pub type Result<T> = std::result::Result<T, Error>;
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Raw encoded messages travel between the transport tasks and the
/// dispatch loop as plain strings over unbounded FIFO queues.
pub type MessageQueue = async_channel::Sender<String>;
pub type MessageQueueListener = async_channel::Receiver<String>;

pub fn message_queue() -> (MessageQueue, MessageQueueListener) {
    async_channel::unbounded()
}
