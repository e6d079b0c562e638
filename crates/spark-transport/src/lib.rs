#![deny(unsafe_code)]
#![doc = "spark-transport: 连接协作者契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：TLS 等协议处理器只需要“可关闭、可等待关闭”的连接句柄，不应感知具体套接字或引导流程。"]
#![doc = "- **What**：定义 [`Connection`] trait、关闭原因 [`CloseReason`] 以及默认实现 [`ConnectionHandle`]。"]
#![doc = "- **How**：关闭状态通过 `tokio::sync::watch` 广播，首个关闭请求生效，后续请求全部视为幂等空操作。"]

pub mod connection;

pub use connection::{CloseReason, ClosedFuture, Connection, ConnectionHandle};
