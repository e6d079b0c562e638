use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use rustls::{ServerConfig, ServerConnection};
use spark_transport::{CloseReason, Connection, ConnectionHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

use crate::{
    callback::HandshakeFailureContext,
    classifier::{FailurePhase, HandshakeFailure},
    config::{HotReloadingServerConfig, TlsHandlerConfiguration},
    coordinator::{HandshakeErrorCoordinator, HandshakeState, Resolution},
    engine::TlsEngine,
    error::TlsFailure,
    pipeline::{InboundHandler, Pipeline, TlsUserEvent},
};

/// 单次明文读取的缓冲大小。
const PLAINTEXT_CHUNK: usize = 4096;

/// 一条连接被驱动结束后的摘要。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionOutcome {
    /// 握手状态机的最终状态。
    pub state: HandshakeState,
    /// 连接的关闭原因。
    pub close_reason: Option<CloseReason>,
    /// 从对端收到的总字节数。
    pub bytes_received: u64,
}

/// TLS 服务端协议处理器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在字节流与下游管道之间终结 TLS：解密入站数据、加密出站数据；
/// - 握手失败时把控制权交给可插拔的握手错误协调器，而不是硬编码“报错并关闭”。
///
/// ## 逻辑（How）
/// - 每条连接由一次 [`serve`](Self::serve) 调用驱动，调用方通常为其单独 `tokio::spawn` 一个任务；
///   这个任务就是该连接的串行执行上下文：读事件、失败、回调完成都在其中依次发生；
/// - `rustls::ServerConnection` 以 sans-IO 方式驱动：读到的密文经 `read_tls`/`process_new_packets`
///   进入状态机，待发送的记录经 `write_tls` 写回字节流；
/// - 失败交给内部的握手错误协调器，等待自定义回调期间不再读取字节流，其它事件自然被挂起；
/// - 回调接管后不再处理 TLS 记录，但仍监视字节流：对端断开即以 `PeerClosed` 关闭连接，
///   只记录日志的回调也不会让连接滞留。
///
/// ## 契约（What）
/// - 下游 Handler 收到的事件顺序：`on_channel_active` → 握手完成事件 → 数据 →
///   （错误）→ `ShutdownCompleted`（仅正常结束）→ `on_channel_inactive`；
/// - 处理器配置构造后不可变，可被任意多条连接并发共享。
#[derive(Clone, Debug)]
pub struct TlsServerHandler {
    server_config: HotReloadingServerConfig,
    configuration: Arc<TlsHandlerConfiguration>,
}

impl TlsServerHandler {
    /// 创建处理器。
    pub fn new(
        server_config: HotReloadingServerConfig,
        configuration: TlsHandlerConfiguration,
    ) -> Self {
        Self {
            server_config,
            configuration: Arc::new(configuration),
        }
    }

    /// 证书热更容器。
    pub fn server_config(&self) -> &HotReloadingServerConfig {
        &self.server_config
    }

    /// 处理器配置。
    pub fn configuration(&self) -> &TlsHandlerConfiguration {
        &self.configuration
    }

    /// 驱动单条连接直至结束。
    ///
    /// 握手与数据阶段的错误都经由 `handler` 的 `on_exception_caught` 报告，返回值仅为摘要。
    pub async fn serve<IO, H>(
        &self,
        io: IO,
        connection: ConnectionHandle,
        handler: H,
    ) -> ConnectionOutcome
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
        H: InboundHandler,
    {
        let span = tracing::debug_span!("tls_server", connection = %connection.id());
        let driver = ConnectionDriver {
            io,
            connection: connection.clone(),
            pipeline: Pipeline::new(handler, connection),
            engine: TlsEngine::released(),
            coordinator: HandshakeErrorCoordinator::new(
                self.configuration.handshake_error_callback().cloned(),
            ),
            configuration: Arc::clone(&self.configuration),
            started: Instant::now(),
            bytes_received: 0,
            peer_closed: false,
        };
        driver
            .run(self.server_config.snapshot())
            .instrument(span)
            .await
    }
}

enum DriverEvent {
    Closed,
    Read(io::Result<usize>),
}

struct ConnectionDriver<IO, H> {
    io: IO,
    connection: ConnectionHandle,
    pipeline: Pipeline<H>,
    engine: TlsEngine,
    coordinator: HandshakeErrorCoordinator,
    configuration: Arc<TlsHandlerConfiguration>,
    started: Instant,
    bytes_received: u64,
    peer_closed: bool,
}

impl<IO, H> ConnectionDriver<IO, H>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    H: InboundHandler,
{
    async fn run(mut self, config: Arc<ServerConfig>) -> ConnectionOutcome {
        self.pipeline.fire_channel_active();
        match ServerConnection::new(config) {
            Ok(session) => {
                self.engine = TlsEngine::new(session);
                self.drain_outbound();
            }
            Err(error) => self.fail(TlsFailure::Protocol(error)).await,
        }

        let mut read_buf = vec![0u8; self.configuration.options().read_buffer_size];
        while !self.engine.is_released() && !self.peer_closed {
            if let Err(error) = self.flush_tls().await {
                self.fail(TlsFailure::Io(error)).await;
                break;
            }

            let closed = self.connection.closed();
            let event = tokio::select! {
                biased;
                _ = closed => DriverEvent::Closed,
                read = self.io.read(&mut read_buf) => DriverEvent::Read(read),
            };

            match event {
                DriverEvent::Closed => break,
                DriverEvent::Read(Ok(0)) => self.on_eof().await,
                DriverEvent::Read(Ok(read)) => {
                    self.bytes_received += read as u64;
                    match self.ingest(&read_buf[..read]) {
                        Ok(()) => self.drain_outbound(),
                        Err(failure) => self.fail(failure).await,
                    }
                }
                DriverEvent::Read(Err(error)) => self.fail(TlsFailure::Io(error)).await,
            }
        }

        self.finish().await
    }

    /// 把一段密文送入状态机，并派发由此产生的握手完成事件与明文。
    fn ingest(&mut self, bytes: &[u8]) -> Result<(), TlsFailure> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let Some(session) = self.engine.session_mut() else {
                return Ok(());
            };
            let consumed = session.read_tls(&mut remaining)?;
            session.process_new_packets()?;
            let completed = !session.is_handshaking();

            if completed && self.coordinator.state() == HandshakeState::Active {
                self.complete_handshake()?;
            }
            self.deliver_plaintext()?;
            if consumed == 0 || self.peer_closed {
                break;
            }
        }
        Ok(())
    }

    fn complete_handshake(&mut self) -> Result<(), TlsFailure> {
        let Some(session) = self.engine.session() else {
            return Ok(());
        };
        if let Some(verify) = self.configuration.peer_verification() {
            let certificates = session.peer_certificates().unwrap_or(&[]);
            verify(certificates).map_err(TlsFailure::PeerRejected)?;
        }
        let event = TlsUserEvent::HandshakeCompleted {
            server_name: session.server_name().map(str::to_owned),
            alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
        };

        if let Err(invalid) = self.coordinator.on_handshake_completed() {
            tracing::warn!(%invalid, "handshake completion ignored");
            return Ok(());
        }
        tracing::debug!("tls handshake completed");
        self.pipeline.fire_user_event(event);
        Ok(())
    }

    fn deliver_plaintext(&mut self) -> Result<(), TlsFailure> {
        let Some(session) = self.engine.session_mut() else {
            return Ok(());
        };
        let mut messages = Vec::new();
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        let mut close_notify = false;
        loop {
            match session.reader().read(&mut chunk) {
                Ok(0) => {
                    close_notify = true;
                    break;
                }
                Ok(read) => messages.push(Bytes::copy_from_slice(&chunk[..read])),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(TlsFailure::Io(error)),
            }
        }

        for message in messages {
            self.pipeline.fire_read(message);
        }
        if close_notify {
            tracing::debug!("peer sent close_notify");
            self.mark_peer_closed();
        }
        Ok(())
    }

    /// 把下游 Handler 排队的明文交给 `rustls` 加密。
    fn drain_outbound(&mut self) {
        let pending = self.pipeline.context().take_outbound();
        if pending.is_empty() {
            return;
        }
        let Some(session) = self.engine.session_mut() else {
            tracing::trace!(dropped = pending.len(), "tls engine released, outbound dropped");
            return;
        };
        for message in pending {
            if let Err(error) = session.writer().write_all(&message) {
                tracing::warn!(%error, "failed to queue outbound plaintext");
                break;
            }
        }
    }

    async fn flush_tls(&mut self) -> io::Result<()> {
        let mut records = Vec::new();
        if let Some(session) = self.engine.session_mut() {
            while session.wants_write() {
                session.write_tls(&mut records)?;
            }
        }
        if records.is_empty() {
            return Ok(());
        }
        self.io.write_all(&records).await?;
        self.io.flush().await
    }

    async fn on_eof(&mut self) {
        if self.coordinator.state() == HandshakeState::Established {
            tracing::debug!("peer closed the stream without close_notify");
            self.mark_peer_closed();
        } else {
            self.fail(TlsFailure::UnexpectedEof).await;
        }
    }

    fn mark_peer_closed(&mut self) {
        self.peer_closed = true;
        self.connection.close(CloseReason::PeerClosed);
    }

    async fn fail(&mut self, raw: TlsFailure) {
        let phase = match self.coordinator.state() {
            HandshakeState::Established => FailurePhase::PostHandshake,
            _ => FailurePhase::Handshake,
        };
        tracing::debug!(
            %phase,
            error = %raw,
            category = ?raw.category(),
            "tls failure detected"
        );

        if self.configuration.options().flush_alert_on_failure
            && let Err(error) = self.flush_tls().await
        {
            tracing::trace!(%error, "failed to flush tls alert");
        }

        let server_name = self
            .engine
            .session()
            .and_then(|session| session.server_name())
            .map(str::to_owned);
        let context = HandshakeFailureContext::new(
            self.connection.id(),
            phase,
            raw.category(),
            server_name,
            self.bytes_received,
            self.started.elapsed(),
        );
        let failure = HandshakeFailure::new(raw, self.connection.clone(), phase);

        match self
            .coordinator
            .on_failure(failure, context, &self.pipeline, &mut self.engine)
            .await
        {
            Ok(Resolution::Intercepted) => tracing::trace!("tls failure resolved by callback"),
            Ok(Resolution::Propagated(propagation)) => tracing::trace!(
                delivered = propagation.delivered,
                engine_released = propagation.engine_released,
                "tls failure resolved by fallback"
            ),
            Err(invalid) => tracing::warn!(%invalid, "duplicate tls failure ignored"),
        }
    }

    /// 回调接管后等待连接结束：应用关闭连接，或对端断开底层流。
    ///
    /// 引擎已释放，期间读到的字节只计数、不解析；EOF 记为 `PeerClosed`，读错误记为 `TransportError`。
    async fn await_close_after_interception(&mut self) -> CloseReason {
        let mut discard = vec![0u8; PLAINTEXT_CHUNK];
        loop {
            let closed = self.connection.closed();
            let event = tokio::select! {
                biased;
                reason = closed => return reason,
                read = self.io.read(&mut discard) => read,
            };
            let reason = match event {
                Ok(0) => CloseReason::PeerClosed,
                Ok(read) => {
                    self.bytes_received += read as u64;
                    tracing::trace!(read, "bytes after interception discarded");
                    continue;
                }
                Err(error) => {
                    tracing::debug!(%error, "transport failed after interception");
                    CloseReason::TransportError
                }
            };
            self.connection.close(reason);
            return self.connection.close_reason().unwrap_or(reason);
        }
    }

    async fn finish(mut self) -> ConnectionOutcome {
        match self.coordinator.state() {
            HandshakeState::Intercepted => {
                let reason = self.await_close_after_interception().await;
                tracing::debug!(%reason, "intercepted connection closed");
            }
            HandshakeState::Active | HandshakeState::Established => {
                if self.configuration.options().send_close_notify
                    && let Some(session) = self.engine.session_mut()
                {
                    session.send_close_notify();
                    if let Err(error) = self.flush_tls().await {
                        tracing::trace!(%error, "failed to flush close_notify");
                    }
                }
            }
            HandshakeState::Failing | HandshakeState::Propagated => {}
        }

        let state = self.coordinator.state();
        if state == HandshakeState::Established {
            self.pipeline.fire_user_event(TlsUserEvent::ShutdownCompleted);
        }
        self.engine.release();
        if let Err(error) = self.io.shutdown().await {
            tracing::trace!(%error, "failed to shut down transport stream");
        }
        self.pipeline.fire_channel_inactive();

        ConnectionOutcome {
            state,
            close_reason: self.connection.close_reason(),
            bytes_received: self.bytes_received,
        }
    }
}
