use std::{io, sync::Arc, time::Duration};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

/// 用户回调与校验回调使用的通用错误类型。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 握手失败时向管道投递的稳定错误码。
pub const HANDSHAKE_FAILED: &str = "spark.transport.tls.handshake_failed";

/// 握手完成后的读写/协议错误错误码。
pub const STREAM_FAILED: &str = "spark.transport.tls.stream_failed";

/// 协议处理器在驱动 TLS 状态机时观察到的原始失败。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手阶段的失败来源多样：非 TLS 输入、协议违规、证书被拒、底层流中断；
/// - 协调器需要把“原始失败”原样交给用户回调，并在回调失败时以同一个值驱动兜底传播，
///   因此该类型在处理器内部总以 `Arc<TlsFailure>` 共享，不会被复制或替换。
///
/// ## 契约（What）
/// - `Protocol`：`rustls` 状态机拒绝了对端数据；
/// - `Io`：底层字节流读写失败；
/// - `UnexpectedEof`：握手完成前对端关闭了字节流；
/// - `PeerRejected`：自定义对端校验回调拒绝了证书链。
#[derive(Debug, Error)]
pub enum TlsFailure {
    /// TLS 协议错误。
    #[error("tls protocol error: {0}")]
    Protocol(#[from] RustlsError),
    /// 底层 IO 错误。
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    /// 握手未完成时对端关闭。
    #[error("peer closed the stream before the handshake completed")]
    UnexpectedEof,
    /// 对端证书被自定义校验拒绝。
    #[error("peer verification rejected: {0}")]
    PeerRejected(#[source] BoxError),
}

impl TlsFailure {
    /// 推导失败的处置分类。
    pub fn category(&self) -> FailureCategory {
        match self {
            TlsFailure::Protocol(error) => protocol_category(error),
            TlsFailure::Io(error) => io_category(error),
            TlsFailure::UnexpectedEof => FailureCategory::Retryable {
                after: RETRY_AFTER_DISCONNECT,
            },
            TlsFailure::PeerRejected(_) => FailureCategory::Security(SecurityClass::Authentication),
        }
    }
}

/// 安全类失败的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityClass {
    /// 对端发送了畸形或违反协议的记录，含非 TLS 输入。
    Integrity,
    /// 证书缺失、不受信任或被自定义校验拒绝。
    Authentication,
    /// 对端明确拒绝访问。
    Authorization,
    /// 双方没有可共同使用的版本、套件、扩展或 ALPN。
    Negotiation,
}

/// 失败的处置分类，随上下文交给握手错误回调，也写入传播日志。
///
/// - `Security`：不应自动重试，适合计数告警或拉黑来源；
/// - `Local`：本端配置或运行环境的问题，与对端无关；
/// - `Retryable`：连接层面的瞬时中断，客户端可在建议时长后重连。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    /// 安全相关。
    Security(SecurityClass),
    /// 本端问题。
    Local,
    /// 瞬时故障。
    Retryable {
        /// 建议的退避时长。
        after: Duration,
    },
}

impl FailureCategory {
    /// 是否为安全类失败。
    pub fn is_security(&self) -> bool {
        matches!(self, FailureCategory::Security(_))
    }
}

/// 经由管道标准错误通道投递的类型化错误。
///
/// # 契约（What）
/// - `HandshakeFailed` 即 `handshakeFailed(underlying)`：握手阶段失败的唯一对外表示，
///   每次失败的握手至多投递一次，除非自定义回调完整接管；
/// - `Stream`：握手完成后的失败，不经过拦截，原样透传；
/// - 两个变体都携带原始 [`TlsFailure`]，回调自身产生的错误永远不会出现在这里。
#[derive(Clone, Debug, Error)]
pub enum TlsHandlerError {
    /// TLS 握手失败。
    #[error("tls handshake failed: {0}")]
    HandshakeFailed(#[source] Arc<TlsFailure>),
    /// 握手完成后的传输或协议失败。
    #[error("tls stream failed: {0}")]
    Stream(#[source] Arc<TlsFailure>),
}

impl TlsHandlerError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TlsHandlerError::HandshakeFailed(_) => HANDSHAKE_FAILED,
            TlsHandlerError::Stream(_) => STREAM_FAILED,
        }
    }

    /// 被包装的原始失败。
    pub fn underlying(&self) -> &TlsFailure {
        match self {
            TlsHandlerError::HandshakeFailed(failure) | TlsHandlerError::Stream(failure) => {
                failure
            }
        }
    }

    /// 是否为握手失败。
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, TlsHandlerError::HandshakeFailed(_))
    }

    /// 处置分类，直接继承原始失败。
    pub fn category(&self) -> FailureCategory {
        self.underlying().category()
    }
}

/// 对端断开后建议的重连等待。
const RETRY_AFTER_DISCONNECT: Duration = Duration::from_millis(50);

/// 服务端视角：除少数本端故障与明确的协商/认证问题外，`rustls` 拒绝的输入都视为对端违规。
fn protocol_category(error: &RustlsError) -> FailureCategory {
    match error {
        RustlsError::AlertReceived(alert) => alert_category(*alert),
        RustlsError::NoCertificatesPresented
        | RustlsError::InvalidCertificate(_)
        | RustlsError::InvalidCertRevocationList(_) => {
            FailureCategory::Security(SecurityClass::Authentication)
        }
        RustlsError::PeerIncompatible(_) | RustlsError::NoApplicationProtocol => {
            FailureCategory::Security(SecurityClass::Negotiation)
        }
        RustlsError::FailedToGetCurrentTime
        | RustlsError::FailedToGetRandomBytes
        | RustlsError::EncryptError
        | RustlsError::General(_) => FailureCategory::Local,
        _ => FailureCategory::Security(SecurityClass::Integrity),
    }
}

/// 对端发来的告警反映的是它对我们的判定。
fn alert_category(alert: AlertDescription) -> FailureCategory {
    match alert {
        AlertDescription::CloseNotify | AlertDescription::UserCanceled => {
            FailureCategory::Retryable {
                after: RETRY_AFTER_DISCONNECT,
            }
        }
        AlertDescription::AccessDenied => FailureCategory::Security(SecurityClass::Authorization),
        AlertDescription::BadCertificate
        | AlertDescription::UnsupportedCertificate
        | AlertDescription::CertificateRevoked
        | AlertDescription::CertificateExpired
        | AlertDescription::CertificateUnknown
        | AlertDescription::UnknownCA
        | AlertDescription::CertificateRequired => {
            FailureCategory::Security(SecurityClass::Authentication)
        }
        AlertDescription::HandshakeFailure
        | AlertDescription::ProtocolVersion
        | AlertDescription::InsufficientSecurity
        | AlertDescription::UnrecognisedName
        | AlertDescription::NoApplicationProtocol => {
            FailureCategory::Security(SecurityClass::Negotiation)
        }
        AlertDescription::InternalError => FailureCategory::Local,
        _ => FailureCategory::Security(SecurityClass::Integrity),
    }
}

fn io_category(error: &io::Error) -> FailureCategory {
    match error.kind() {
        io::ErrorKind::OutOfMemory | io::ErrorKind::PermissionDenied => FailureCategory::Local,
        _ => FailureCategory::Retryable {
            after: RETRY_AFTER_DISCONNECT,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::InvalidMessage;

    #[test]
    fn malformed_records_are_integrity_violations() {
        let failure = TlsFailure::from(RustlsError::InvalidMessage(
            InvalidMessage::InvalidContentType,
        ));
        assert_eq!(
            failure.category(),
            FailureCategory::Security(SecurityClass::Integrity)
        );
    }

    #[test]
    fn certificate_alerts_map_to_authentication() {
        let failure = TlsFailure::from(RustlsError::AlertReceived(AlertDescription::UnknownCA));
        assert_eq!(
            failure.category(),
            FailureCategory::Security(SecurityClass::Authentication)
        );
    }

    #[test]
    fn negotiation_failures_are_distinguished_from_local_faults() {
        let incompatible = TlsFailure::from(RustlsError::PeerIncompatible(
            rustls::PeerIncompatible::NoCipherSuitesInCommon,
        ));
        assert_eq!(
            incompatible.category(),
            FailureCategory::Security(SecurityClass::Negotiation)
        );
        let version_alert =
            TlsFailure::from(RustlsError::AlertReceived(AlertDescription::ProtocolVersion));
        assert_eq!(
            version_alert.category(),
            FailureCategory::Security(SecurityClass::Negotiation)
        );

        let local = TlsFailure::from(RustlsError::FailedToGetRandomBytes);
        assert_eq!(local.category(), FailureCategory::Local);
        assert!(!local.category().is_security());
    }

    #[test]
    fn reset_streams_are_retryable() {
        let failure = TlsFailure::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(
            failure.category(),
            FailureCategory::Retryable { .. }
        ));
    }

    #[test]
    fn handler_error_keeps_the_original_failure() {
        let raw = Arc::new(TlsFailure::UnexpectedEof);
        let error = TlsHandlerError::HandshakeFailed(Arc::clone(&raw));
        assert_eq!(error.code(), HANDSHAKE_FAILED);
        assert!(error.is_handshake_failure());
        assert!(matches!(error.underlying(), TlsFailure::UnexpectedEof));
        assert!(error.to_string().starts_with("tls handshake failed"));
        assert!(matches!(error.category(), FailureCategory::Retryable { .. }));

        let stream = TlsHandlerError::Stream(raw);
        assert_eq!(stream.code(), STREAM_FAILED);
        assert!(!stream.is_handshake_failure());
    }
}
