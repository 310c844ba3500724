pub mod context;
pub mod events;
pub mod pipeline;
pub mod plugins;
pub mod stream;
pub mod turn;

pub use events::{ChatEvent, EventBus, Next, Plugin, PluginError};
pub use pipeline::ChatPipeline;
pub use stream::{ActiveStream, MemoryStreamManager, RedisStreamManager, StreamManager};
pub use turn::{ChatFrame, ChatTurn, Passage, TurnServices};
