use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_transport::{CloseReason, Connection, ConnectionHandle};

use crate::error::TlsHandlerError;

/// TLS 处理器向下游管道广播的用户事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsUserEvent {
    /// 握手（以及可选的自定义对端校验）成功完成。
    HandshakeCompleted {
        /// 客户端提供的 SNI。
        server_name: Option<String>,
        /// 协商得到的 ALPN 标识。
        alpn_protocol: Option<Vec<u8>>,
    },
    /// 双方完成 `close_notify` 交换或应用主动关闭后的收尾。
    ShutdownCompleted,
}

/// 位于 TLS 处理器下游的入站事件处理合约。
///
/// # 契约说明（What）
/// - 所有方法都在连接所属的驱动任务中串行调用，必须无阻塞；
/// - `on_exception_caught` 是标准错误通道：握手失败以
///   [`TlsHandlerError::HandshakeFailed`] 的形式至多出现一次，其余错误原样透传；
/// - `on_channel_inactive` 在连接生命周期末尾恰好调用一次，此后不再有任何回调。
///
/// # 风险提示（Trade-offs）
/// - 请避免在 Handler 内部持久化 `PipelineContext` 引用，需要异步工作时克隆
///   [`PipelineContext::connection`] 即可。
pub trait InboundHandler: Send + Sync + 'static {
    /// 传输层连接可用（握手开始之前）。
    fn on_channel_active(&self, _ctx: &PipelineContext) {}

    /// 解密后的应用数据。
    fn on_read(&self, ctx: &PipelineContext, msg: Bytes);

    /// 用户事件。
    fn on_user_event(&self, _ctx: &PipelineContext, _event: TlsUserEvent) {}

    /// 异常处理。
    fn on_exception_caught(&self, ctx: &PipelineContext, error: TlsHandlerError);

    /// 通道不再活跃。
    fn on_channel_inactive(&self, _ctx: &PipelineContext) {}
}

impl<H> InboundHandler for Arc<H>
where
    H: InboundHandler + ?Sized,
{
    fn on_channel_active(&self, ctx: &PipelineContext) {
        (**self).on_channel_active(ctx)
    }

    fn on_read(&self, ctx: &PipelineContext, msg: Bytes) {
        (**self).on_read(ctx, msg)
    }

    fn on_user_event(&self, ctx: &PipelineContext, event: TlsUserEvent) {
        (**self).on_user_event(ctx, event)
    }

    fn on_exception_caught(&self, ctx: &PipelineContext, error: TlsHandlerError) {
        (**self).on_exception_caught(ctx, error)
    }

    fn on_channel_inactive(&self, ctx: &PipelineContext) {
        (**self).on_channel_inactive(ctx)
    }
}

/// Handler 回调时可用的连接上下文。
///
/// - `write` 只把明文放入出站队列，由驱动任务在当前事件处理完毕后加密并刷出；
/// - `close` 等价于以 [`CloseReason::Application`] 关闭连接。
pub struct PipelineContext {
    connection: ConnectionHandle,
    outbound: Mutex<Vec<Bytes>>,
}

impl PipelineContext {
    pub(crate) fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            outbound: Mutex::new(Vec::new()),
        }
    }

    /// 所属连接。
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// 写入待加密的明文。
    pub fn write(&self, msg: Bytes) {
        if msg.is_empty() {
            return;
        }
        self.outbound.lock().push(msg);
    }

    /// 关闭连接，返回本次调用是否发起了关闭。
    pub fn close(&self) -> bool {
        self.connection.close(CloseReason::Application)
    }

    pub(crate) fn take_outbound(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.outbound.lock())
    }
}

/// 绑定到单条连接的下游管道。
///
/// `on_channel_inactive` 之后管道即被拆除，其后的事件（包括迟到的兜底错误）
/// 都是记录日志的空操作。
pub(crate) struct Pipeline<H> {
    handler: H,
    context: PipelineContext,
    active: bool,
}

impl<H: InboundHandler> Pipeline<H> {
    pub(crate) fn new(handler: H, connection: ConnectionHandle) -> Self {
        Self {
            handler,
            context: PipelineContext::new(connection),
            active: false,
        }
    }

    pub(crate) fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub(crate) fn fire_channel_active(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.handler.on_channel_active(&self.context);
    }

    pub(crate) fn fire_read(&self, msg: Bytes) {
        if self.active {
            self.handler.on_read(&self.context, msg);
        }
    }

    pub(crate) fn fire_user_event(&self, event: TlsUserEvent) {
        if self.active {
            self.handler.on_user_event(&self.context, event);
        }
    }

    /// 投递错误，返回是否真正送达。
    pub(crate) fn fire_exception_caught(&self, error: TlsHandlerError) -> bool {
        if !self.active {
            tracing::debug!(code = error.code(), "pipeline already inactive, error dropped");
            return false;
        }
        self.handler.on_exception_caught(&self.context, error);
        true
    }

    pub(crate) fn fire_channel_inactive(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.handler.on_channel_inactive(&self.context);
    }
}
