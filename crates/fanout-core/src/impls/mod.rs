//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryOperationStore**: Operation を JSON 文字列として保持
//! - **InMemoryConfigStore**: 呼び出し元ごとのプロバイダ設定
//! - **ProviderRegistry**: 起動時に組み立てるプロバイダ登録簿
//!
//! 永続化が必要なら `OperationStore` を別クレートで実装します。

pub mod config_store;
pub mod operation_store;
pub mod registry;

pub use self::config_store::InMemoryConfigStore;
pub use self::operation_store::InMemoryOperationStore;
pub use self::registry::ProviderRegistry;
