#![doc = r#"
# spark-transport-tls

## 设计动机（Why）
- **安全入口**：在字节流与业务管道之间终结 TLS，为下游 Handler 提供明文读写；
- **可插拔的握手失败处理**：非 TLS 输入、协议违规或证书问题导致握手失败时，
  应用可以注册异步回调接管诊断、日志或拆除；回调失败时自动回落到标准错误路径；
- **热更新**：依托 `ArcSwap` 在不中断现有连接的情况下替换证书或密码套件配置。

## 核心契约（What）
- [`TlsServerHandler`]：驱动单条连接的 TLS 会话，并把事件派发给下游 [`InboundHandler`]；
- 握手错误协调器：以 [`HandshakeState`] 表达的 `Active → Failing → {Intercepted | Propagated}` 单次分派状态机，
  保证每次失败的握手恰好得到一个终态：要么回调接管，要么投递一次
  [`TlsHandlerError::HandshakeFailed`]，绝不两者兼有，也绝不两者皆无；
- [`HandshakeErrorClassifier`]：只有握手阶段的失败可被拦截，握手后的失败原样透传；
- [`CustomErrorCallbackInvoker`] 负责调用回调，兜底传播器负责默认投递，二者都由处理器内部编排。

## 实现策略（How）
- 使用 `rustls::ServerConnection` 以 sans-IO 方式驱动握手，字节流可以是任意
  `AsyncRead + AsyncWrite`；
- 每条连接的所有事件都在调用 [`TlsServerHandler::serve`] 的任务中串行执行，
  回调的完成同样在该任务中被观察，状态机转换不存在竞态；
- 连接关闭语义由 `spark-transport` 的 [`ConnectionHandle`](spark_transport::ConnectionHandle) 提供，
  多次关闭请求只产生一次关闭通知。

## 风险与考量（Trade-offs）
- 核心不为回调设置超时，需要有界等待的调用方应在回调内部自行施加；
- 回调成功后，底层流会保持到应用关闭连接或对端断开为止，期间到达的字节被丢弃。
"#]

mod callback;
mod classifier;
mod config;
mod coordinator;
mod engine;
mod error;
mod handler;
mod pipeline;
mod propagator;

#[cfg(test)]
mod test_support;

pub use callback::{
    CallbackOutcome, CustomErrorCallbackInvoker, HandshakeErrorCallback, HandshakeFailureContext,
    PeerVerificationCallback, handshake_error_callback, peer_verification_callback,
};
pub use classifier::{FailurePhase, HandshakeErrorClassifier, HandshakeFailure};
pub use config::{
    ConfigError, HotReloadingServerConfig, TlsHandlerConfiguration,
    TlsHandlerConfigurationBuilder, TlsHandlerOptions,
};
pub use coordinator::{HandshakeState, InvalidTransition};
pub use error::{
    BoxError, FailureCategory, HANDSHAKE_FAILED, STREAM_FAILED, SecurityClass, TlsFailure,
    TlsHandlerError,
};
pub use handler::{ConnectionOutcome, TlsServerHandler};
pub use pipeline::{InboundHandler, PipelineContext, TlsUserEvent};
