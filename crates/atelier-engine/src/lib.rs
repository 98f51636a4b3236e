pub mod clock;
pub mod config;
pub mod encoder;
pub mod error;
pub mod gateway;
pub mod invoker;
pub mod media;
pub mod providers;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::GatewayConfig;
pub use encoder::{Encoding, InferenceResult, ResultPayload};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use invoker::{Invocation, RetryingInvoker};
pub use media::ImageFetcher;
pub use providers::{InferenceProvider, ProviderCall, ProviderRegistry, ProviderReply};
