//! コンテナバックエンドの契約

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use fleetvisor_core::ContainerHandle;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// コンテナランタイムの抽象
///
/// エンジンはこのトレイト越しにのみコンテナを操作します。
/// すべてのメソッドは同一ハンドルに対して並行に呼ばれないことを前提にして構いません
/// （エンジン側でプロセス名ごとに直列化されます）。`inspect` と
/// `wait_exit` だけは監視タスクから並行に呼ばれます。
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// バックエンド名（ログ表示用）
    fn name(&self) -> &str;

    /// コンテナを作成（まだ起動しない）
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// 作成済みコンテナを起動
    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// 停止を要求する。バックエンドは `grace_period` を猶予として扱ってよい
    async fn signal_stop(&self, handle: &ContainerHandle, grace_period: Duration) -> Result<()>;

    /// 即時に強制終了
    async fn force_kill(&self, handle: &ContainerHandle) -> Result<()>;

    /// コンテナを削除（存在しなければ成功扱い）
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// 現在の状態を取得
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspect>;

    /// コンテナが終了するまで待ち、終了コードを返す
    async fn wait_exit(&self, handle: &ContainerHandle) -> Result<Option<i64>>;

    /// 出力ストリームを開く
    ///
    /// `follow` なら実行中は終わらず、コンテナ終了で終端する。
    /// 呼び出すたびに新しいストリームを返す。
    fn stream_output(
        &self,
        handle: &ContainerHandle,
        options: &OutputOptions,
    ) -> BoxStream<'static, Result<Bytes>>;

    /// このエンジンのラベルが付いたコンテナを列挙
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;
}

/// 出力ストリームの取得条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    /// 末尾から何行を返すか（None なら全件）
    pub tail: Option<usize>,
    /// 新しい出力を待ち続けるか
    pub follow: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            tail: None,
            follow: true,
        }
    }
}

/// コンテナ作成に必要な情報
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// 管理プロセス名
    pub process: String,
    pub image_ref: String,
    pub env: HashMap<String, String>,
}

/// inspect の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
}

impl ContainerInspect {
    pub fn running() -> Self {
        Self {
            running: true,
            exit_code: None,
        }
    }

    pub fn exited(exit_code: Option<i64>) -> Self {
        Self {
            running: false,
            exit_code,
        }
    }
}

/// バックエンド上で見つかった管理対象コンテナ
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub handle: ContainerHandle,
    /// ラベルに記録されたプロセス名
    pub process: String,
    pub running: bool,
}
