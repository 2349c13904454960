//! fanout-core
//!
//! Fans one comparison request out to many AI provider calls, runs them with
//! bounded concurrency, retry and per-provider circuit breaking, and tracks the
//! whole batch as one pollable long-running operation.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, task, operation, provider, comparison）
//! - **ports**: 抽象化レイヤー（ProviderClient, ProviderConfigStore, OperationStore, Clock, IdGenerator）
//! - **queue**: TaskQueue / TaskManager（リトライ・バックオフ・並列数制御）
//! - **resilience**: サービス単位の CircuitBreaker
//! - **impls**: ports の実装（InMemoryOperationStore など開発用）
//! - **app**: AppBuilder と ComparisonService

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod resilience;

pub use app::{AppBuilder, ComparisonService, Dispatch, DispatchMode, FanoutSettings};
pub use error::{FanoutError, WorkError};
