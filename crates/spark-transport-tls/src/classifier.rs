use std::{fmt, sync::Arc};

use spark_transport::ConnectionHandle;

use crate::error::TlsFailure;

/// 失败发生时 TLS 会话所处的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailurePhase {
    /// 会话尚未建立（包括握手完成后的自定义对端校验）。
    Handshake,
    /// 会话已建立，失败来自后续的读写。
    PostHandshake,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Handshake => f.write_str("handshake"),
            FailurePhase::PostHandshake => f.write_str("post-handshake"),
        }
    }
}

/// 一次失败的握手尝试。
///
/// # 契约（What）
/// - 每次失败的握手只构造一次，构造后不可变；
/// - `raw` 以 `Arc` 共享，回调与兜底传播看到的是同一个原始失败；
/// - `connection` 仅为借用关系的句柄克隆，不代表拥有连接。
#[derive(Clone, Debug)]
pub struct HandshakeFailure {
    raw: Arc<TlsFailure>,
    connection: ConnectionHandle,
    phase: FailurePhase,
}

impl HandshakeFailure {
    /// 记录一次失败。
    pub fn new(raw: TlsFailure, connection: ConnectionHandle, phase: FailurePhase) -> Self {
        Self {
            raw: Arc::new(raw),
            connection,
            phase,
        }
    }

    /// 原始失败。
    pub fn raw(&self) -> &Arc<TlsFailure> {
        &self.raw
    }

    /// 发生失败的连接。
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// 失败阶段。
    pub fn phase(&self) -> FailurePhase {
        self.phase
    }
}

/// 判定失败是否允许交给自定义回调拦截。
///
/// 只有握手阶段的失败可以被拦截；握手后的失败一律走标准错误路径，
/// 自定义回调的契约因此不会被无关的失败类别污染。判定是纯函数，没有副作用。
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeErrorClassifier;

impl HandshakeErrorClassifier {
    /// 失败是否为可拦截的握手阶段失败。
    pub fn is_interceptable(&self, failure: &HandshakeFailure) -> bool {
        match failure.phase() {
            FailurePhase::Handshake => true,
            FailurePhase::PostHandshake => false,
        }
    }
}
