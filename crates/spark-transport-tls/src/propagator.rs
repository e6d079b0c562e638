use std::sync::Arc;

use spark_transport::{CloseReason, Connection};

use crate::{
    classifier::{FailurePhase, HandshakeFailure},
    engine::TlsEngine,
    error::TlsHandlerError,
    pipeline::{InboundHandler, Pipeline},
};

/// 兜底传播的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Propagation {
    /// 错误是否送达管道；管道已拆除时为 `false`。
    pub(crate) delivered: bool,
    /// 本次调用是否释放了 TLS 引擎。
    pub(crate) engine_released: bool,
}

/// 默认行为：把原始失败包装为类型化错误，沿标准错误通道投递，再拆除处理器状态。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 握手阶段失败包装为 [`TlsHandlerError::HandshakeFailed`]，握手后失败原样以
///   [`TlsHandlerError::Stream`] 透传；
/// - 投递之后释放 TLS 引擎，并以幂等方式请求关闭连接（回调可能已经关闭过）；
/// - 每个 [`HandshakeFailure`] 只能传播一次，由协调器的单次分派保证，而非此处的运行期检查。
///
/// ## 风险与权衡（Trade-offs）
/// - 管道已拆除时投递退化为空操作，引擎与连接的拆除依旧执行。
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FallbackErrorPropagator;

impl FallbackErrorPropagator {
    #[must_use]
    pub(crate) fn propagate<H: InboundHandler>(
        &self,
        failure: &HandshakeFailure,
        pipeline: &Pipeline<H>,
        engine: &mut TlsEngine,
    ) -> Propagation {
        let raw = Arc::clone(failure.raw());
        let (error, reason) = match failure.phase() {
            FailurePhase::Handshake => (
                TlsHandlerError::HandshakeFailed(raw),
                CloseReason::HandshakeFailed,
            ),
            FailurePhase::PostHandshake => {
                (TlsHandlerError::Stream(raw), CloseReason::TransportError)
            }
        };
        let code = error.code();
        let category = error.category();
        let delivered = pipeline.fire_exception_caught(error);
        let engine_released = engine.release();
        failure.connection().close(reason);
        tracing::debug!(
            code,
            ?category,
            delivered,
            engine_released,
            "tls failure propagated"
        );
        Propagation {
            delivered,
            engine_released,
        }
    }
}
