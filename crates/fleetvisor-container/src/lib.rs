//! FleetVisor コンテナバックエンド
//!
//! エンジンが使うコンテナ操作の契約（[`ContainerBackend`]）と、
//! bollard による Docker 実装を提供します。

pub mod backend;
pub mod converter;
pub mod docker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod waiter;

pub use backend::*;
pub use converter::*;
pub use docker::*;
pub use error::*;
#[cfg(any(test, feature = "test-utils"))]
pub use fake::*;
pub use waiter::*;
