//! App - アプリケーション層
//!
//! ports・queue・resilience を組み合わせて比較のファンアウトを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証）
//! - **ComparisonService**: compare / get_operation / cancel
//! - **Aggregator**: キューイベントを Operation に反映
//! - **FanoutSettings**: 既定値と環境変数

mod aggregator;
pub mod builder;
pub mod comparison;
pub mod settings;

pub use self::builder::{AppBuilder, BuildError};
pub use self::comparison::{ComparisonOutcome, ComparisonService, Dispatch, DispatchMode};
pub use self::settings::FanoutSettings;
