pub mod load_balancing;
pub mod name_resolution;
pub mod transport;

mod backoff;
mod call;
mod channel;
mod connectivity;
mod filters;
mod load_balanced_call;
mod subchannel;
mod subchannel_pool;
mod work_serializer;

pub use channel::Channel;
pub use channel::ChannelOptions;
pub use connectivity::{ConnectivityState, StateWatcher};
pub use subchannel_pool::{LocalSubchannelPool, SubchannelPool};
