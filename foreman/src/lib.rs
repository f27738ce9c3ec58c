//! Foreman.

#[cfg(feature = "agent")]
#[doc(inline)]
pub use foreman_agent as agent;
#[cfg(feature = "agent")]
#[doc(inline)]
pub use foreman_agent::Agent;
#[cfg(feature = "agent")]
#[doc(inline)]
pub use foreman_agent::AgentServer;
#[cfg(feature = "config")]
#[doc(inline)]
pub use foreman_config as config;
#[cfg(feature = "config")]
#[doc(inline)]
pub use foreman_config::Config;
#[cfg(feature = "docker")]
#[doc(inline)]
pub use foreman_docker as docker;
#[cfg(feature = "engine")]
#[doc(inline)]
pub use foreman_engine as engine;
#[cfg(feature = "engine")]
#[doc(inline)]
pub use foreman_engine::TaskService;
#[cfg(feature = "events")]
#[doc(inline)]
pub use foreman_events as events;
#[cfg(feature = "events")]
#[doc(inline)]
pub use foreman_events::EventStream;
