use std::{borrow::Cow, fmt, future::Future, pin::Pin, sync::Arc};

use tokio::sync::watch;

/// 连接被关闭的原因，仅记录首个关闭请求。
///
/// # 契约说明（What）
/// - 关闭原因一经写入便不可覆盖：回调、兜底传播与应用代码可能先后请求关闭，
///   观察者始终看到第一次请求的原因；
/// - `Released` 表示所有句柄在未显式关闭的情况下被释放。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// 应用或自定义回调主动关闭。
    Application,
    /// 握手失败后由协议处理器发起的标准拆除。
    HandshakeFailed,
    /// 对端发送了关闭通知或断开了底层流。
    PeerClosed,
    /// 握手完成后的传输错误。
    TransportError,
    /// 句柄全部释放，连接未被显式关闭。
    Released,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Application => "application",
            CloseReason::HandshakeFailed => "handshake-failed",
            CloseReason::PeerClosed => "peer-closed",
            CloseReason::TransportError => "transport-error",
            CloseReason::Released => "released",
        };
        f.write_str(text)
    }
}

/// 等待连接关闭的 Future。
pub type ClosedFuture<'a> = Pin<Box<dyn Future<Output = CloseReason> + Send + 'a>>;

/// 协议处理器所依赖的连接协作者契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议处理器（例如 TLS 握手错误协调器）只借用连接，不拥有连接；
/// - 用户回调、兜底传播与应用代码都可能请求关闭，需要统一且幂等的关闭入口。
///
/// ## 契约（What）
/// - `close`：发起异步关闭；仅首个调用返回 `true`，其余调用返回 `false` 且不会产生额外通知；
/// - `closed`：返回在连接关闭时完成的 Future，每个等待者恰好观察到一次完成；
/// - `close_reason`：查询首个关闭请求的原因，未关闭时返回 `None`。
///
/// ## 风险与权衡（Trade-offs）
/// - `close` 只发布关闭意图，真正的套接字释放由持有流的驱动任务在观察到通知后完成。
pub trait Connection: Send + Sync + 'static {
    /// 返回可用于日志或追踪的连接 ID。
    fn id(&self) -> Cow<'_, str>;

    /// 请求关闭连接。
    fn close(&self, reason: CloseReason) -> bool;

    /// 连接是否已被请求关闭。
    fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// 首个关闭请求的原因。
    fn close_reason(&self) -> Option<CloseReason>;

    /// 等待连接关闭。
    fn closed(&self) -> ClosedFuture<'static>;
}

/// 默认的连接句柄实现，克隆代价为一次 `Arc` 引用计数。
///
/// # 实现逻辑（How）
/// - 内部以 `watch::Sender<Option<CloseReason>>` 保存关闭状态；
/// - `close` 借助 `send_if_modified` 在发送端锁内完成“检查并写入”，保证多处并发请求时只发布一次；
/// - `closed` 订阅新的接收端并等待状态变为 `Some`，若所有句柄释放则返回 [`CloseReason::Released`]。
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: String,
    state: watch::Sender<Option<CloseReason>>,
}

impl ConnectionHandle {
    /// 使用给定 ID 创建处于打开状态的连接句柄。
    pub fn new(id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(ConnectionInner {
                id: id.into(),
                state,
            }),
        }
    }

    /// 两个句柄是否指向同一连接。
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Connection for ConnectionHandle {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.inner.id)
    }

    fn close(&self, reason: CloseReason) -> bool {
        let initiated = self.inner.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        });
        if initiated {
            tracing::debug!(connection = %self.inner.id, %reason, "connection close requested");
        } else {
            tracing::trace!(connection = %self.inner.id, %reason, "connection already closed");
        }
        initiated
    }

    fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.state.borrow()
    }

    fn closed(&self) -> ClosedFuture<'static> {
        let mut receiver = self.inner.state.subscribe();
        Box::pin(async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(state) => state.unwrap_or(CloseReason::Released),
                Err(_) => CloseReason::Released,
            }
        })
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
