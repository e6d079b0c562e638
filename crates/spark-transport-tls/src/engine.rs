use rustls::ServerConnection;

/// 单条连接上的 `rustls` 服务端状态机。
///
/// 失败的握手会在兜底传播后释放引擎；释放后的引擎不再产生或消费任何 TLS 记录，
/// 随后到达的字节也不会再被分类。
pub(crate) struct TlsEngine {
    session: Option<ServerConnection>,
}

impl TlsEngine {
    pub(crate) fn new(session: ServerConnection) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// 尚未创建会话即失败时使用的空引擎。
    pub(crate) fn released() -> Self {
        Self { session: None }
    }

    pub(crate) fn session(&self) -> Option<&ServerConnection> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut ServerConnection> {
        self.session.as_mut()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// 释放会话资源，返回本次调用是否真正执行了释放。
    pub(crate) fn release(&mut self) -> bool {
        self.session.take().is_some()
    }
}
