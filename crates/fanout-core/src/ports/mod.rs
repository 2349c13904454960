//! Ports - 抽象化レイヤー
//!
//! 外部コラボレータ（プロバイダ API、設定ストア、永続化）への
//! インターフェースを定義し、実装の詳細を隠蔽します。

pub mod clock;
pub mod config_store;
pub mod id_generator;
pub mod operation_store;
pub mod provider;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::config_store::ProviderConfigStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::operation_store::OperationStore;
pub use self::provider::{ProviderClient, ProviderError};
