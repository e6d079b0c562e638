use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use rustls::pki_types::CertificateDer;
use spark_transport::ConnectionHandle;

use crate::{
    classifier::{FailurePhase, HandshakeFailure},
    error::{BoxError, FailureCategory, TlsFailure},
};

/// 自定义握手错误回调。
///
/// 形如 `(raw_error, connection, context) -> 异步 Result<(), BoxError>`：
/// - 成功完成表示应用完整接管了本次失败，默认错误投递被永久抑制；
/// - 返回错误（或 panic）表示未接管，处理器会用原始失败执行兜底传播。
///
/// 回调可以自由关闭连接、记录日志或执行其它拆除动作。
///
/// # Examples
///
/// ```rust
/// use spark_transport::{CloseReason, Connection};
/// use spark_transport_tls::{BoxError, handshake_error_callback};
///
/// let callback = handshake_error_callback(|error, connection, context| async move {
///     eprintln!("{} failed after {:?}: {error}", context.connection_id, context.elapsed);
///     connection.close(CloseReason::Application);
///     Ok::<(), BoxError>(())
/// });
/// # drop(callback);
/// ```
pub type HandshakeErrorCallback = Arc<
    dyn Fn(
            Arc<TlsFailure>,
            ConnectionHandle,
            HandshakeFailureContext,
        ) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

/// 自定义对端校验回调，在握手完成、会话对外可见之前执行。
///
/// 参数为对端证书链（客户端未出示证书时为空切片）；返回错误即视为握手阶段失败。
pub type PeerVerificationCallback =
    Arc<dyn Fn(&[CertificateDer<'_>]) -> Result<(), BoxError> + Send + Sync>;

/// 将返回任意 `Future` 的闭包包装为 [`HandshakeErrorCallback`]。
pub fn handshake_error_callback<F, Fut>(callback: F) -> HandshakeErrorCallback
where
    F: Fn(Arc<TlsFailure>, ConnectionHandle, HandshakeFailureContext) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(
        move |error: Arc<TlsFailure>,
              connection: ConnectionHandle,
              context: HandshakeFailureContext|
              -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(callback(error, connection, context))
        },
    )
}

/// 将同步校验闭包包装为 [`PeerVerificationCallback`]。
pub fn peer_verification_callback<F>(callback: F) -> PeerVerificationCallback
where
    F: Fn(&[CertificateDer<'_>]) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// 交给回调的诊断上下文。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HandshakeFailureContext {
    /// 连接 ID。
    pub connection_id: String,
    /// 失败阶段，拦截路径上恒为 [`FailurePhase::Handshake`]。
    pub phase: FailurePhase,
    /// 原始失败的处置分类，回调可据此区分安全事件与瞬时中断。
    pub category: FailureCategory,
    /// 客户端在 ClientHello 中提供的 SNI（若已解析到）。
    pub server_name: Option<String>,
    /// 失败前从对端收到的字节数。
    pub bytes_received: u64,
    /// 从处理器开始驱动连接到失败被检测到的耗时。
    pub elapsed: Duration,
}

impl HandshakeFailureContext {
    /// 构造上下文。
    pub fn new(
        connection_id: impl Into<String>,
        phase: FailurePhase,
        category: FailureCategory,
        server_name: Option<String>,
        bytes_received: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            phase,
            category,
            server_name,
            bytes_received,
            elapsed,
        }
    }
}

/// 回调执行的归一化结果。
#[derive(Debug)]
pub enum CallbackOutcome {
    /// 回调成功，应用接管了失败。
    Handled,
    /// 回调失败，携带原始失败（而非回调自身的错误）进入兜底。
    Unhandled(Arc<TlsFailure>),
}

/// 包装用户回调，对一次握手失败恰好调用一次并归一化其结果。
///
/// # 教案级注释
///
/// ## 前置条件
/// - 回调存在（缺省情况由协调器处理）；
/// - 失败已被判定为握手阶段失败。
///
/// ## 逻辑（How）
/// - 同步调用回调得到 Future，再在当前连接的驱动任务上 `await`；
///   驱动任务在等待期间不处理该连接的其它事件，回调完成天然串行化；
/// - 同步调用或异步执行中的 panic 都被 `catch_unwind` 捕获并视为失败；
/// - 回调自身的错误只记录日志，不向管道暴露。
#[derive(Clone)]
pub struct CustomErrorCallbackInvoker {
    callback: HandshakeErrorCallback,
}

impl CustomErrorCallbackInvoker {
    /// 包装回调。
    pub fn new(callback: HandshakeErrorCallback) -> Self {
        Self { callback }
    }

    /// 调用回调并等待其完成。
    pub async fn invoke(
        &self,
        failure: &HandshakeFailure,
        context: HandshakeFailureContext,
    ) -> CallbackOutcome {
        let raw = Arc::clone(failure.raw());
        let connection = failure.connection().clone();

        let pending = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            (self.callback)(Arc::clone(&raw), connection, context)
        })) {
            Ok(pending) => pending,
            Err(_) => {
                tracing::warn!("handshake error callback panicked before returning a future");
                return CallbackOutcome::Unhandled(raw);
            }
        };

        match AssertUnwindSafe(pending).catch_unwind().await {
            Ok(Ok(())) => CallbackOutcome::Handled,
            Ok(Err(error)) => {
                tracing::debug!(callback_error = %error, "handshake error callback failed");
                CallbackOutcome::Unhandled(raw)
            }
            Err(_) => {
                tracing::warn!("handshake error callback panicked");
                CallbackOutcome::Unhandled(raw)
            }
        }
    }
}
