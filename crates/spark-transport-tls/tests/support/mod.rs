//! 握手拦截集成测试共享的夹具：自签名证书、客户端配置与记录型 Handler。

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use spark_transport::ConnectionHandle;
use spark_transport_tls::{
    ConnectionOutcome, HotReloadingServerConfig, InboundHandler, PipelineContext,
    TlsHandlerConfiguration, TlsHandlerError, TlsServerHandler, TlsUserEvent,
};
use tokio::{io::DuplexStream, task::JoinHandle};

pub const NOT_TLS: &[u8] = b"not tls";
const DUPLEX_CAPACITY: usize = 64 * 1024;
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 生成自签名服务端配置，并返回证书以供客户端信任。
pub fn server_config() -> Result<(Arc<ServerConfig>, CertificateDer<'static>)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("生成自签名证书失败")?;
    let certificate = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("选择协议版本失败")?
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key)
        .context("构建服务端 TLS 配置失败")?;
    Ok((Arc::new(config), certificate))
}

/// 构造仅信任指定证书的客户端配置。
pub fn client_config(certificate: &CertificateDer<'static>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(certificate.clone())
        .context("将证书写入 Root Store 失败")?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("选择协议版本失败")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// 下游管道观察到的事件。
#[derive(Clone, Debug)]
pub enum Observed {
    Active,
    Read(Bytes),
    Event(TlsUserEvent),
    Error(TlsHandlerError),
    Inactive,
}

/// 记录事件的下游 Handler，可选地把读到的数据原样回写。
#[derive(Default)]
pub struct Collector {
    echo: bool,
    events: Mutex<Vec<Observed>>,
}

impl Collector {
    pub fn echoing() -> Self {
        Self {
            echo: true,
            events: Mutex::default(),
        }
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<TlsHandlerError> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Observed::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn handshake_failures(&self) -> Vec<TlsHandlerError> {
        self.errors()
            .into_iter()
            .filter(TlsHandlerError::is_handshake_failure)
            .collect()
    }
}

impl InboundHandler for Collector {
    fn on_channel_active(&self, _ctx: &PipelineContext) {
        self.events.lock().push(Observed::Active);
    }

    fn on_read(&self, ctx: &PipelineContext, msg: Bytes) {
        self.events.lock().push(Observed::Read(msg.clone()));
        if self.echo {
            ctx.write(msg);
        }
    }

    fn on_user_event(&self, _ctx: &PipelineContext, event: TlsUserEvent) {
        self.events.lock().push(Observed::Event(event));
    }

    fn on_exception_caught(&self, _ctx: &PipelineContext, error: TlsHandlerError) {
        self.events.lock().push(Observed::Error(error));
    }

    fn on_channel_inactive(&self, _ctx: &PipelineContext) {
        self.events.lock().push(Observed::Inactive);
    }
}

/// 一条在独立任务中被驱动的服务端连接。
pub struct ServerSide {
    pub connection: ConnectionHandle,
    pub collector: Arc<Collector>,
    task: JoinHandle<ConnectionOutcome>,
}

impl ServerSide {
    pub async fn outcome(self) -> Result<ConnectionOutcome> {
        tokio::time::timeout(TEST_TIMEOUT, self.task)
            .await
            .map_err(|_| anyhow!("服务端连接未在超时内结束"))?
            .context("服务端任务异常退出")
    }
}

/// 为给定配置启动服务端，返回客户端一侧的字节流。
pub fn spawn_server(
    server_config: Arc<ServerConfig>,
    configuration: TlsHandlerConfiguration,
    collector: Collector,
) -> (DuplexStream, ServerSide) {
    let (client_io, server_io) = tokio::io::duplex(DUPLEX_CAPACITY);
    let handler = TlsServerHandler::new(HotReloadingServerConfig::new(server_config), configuration);
    let connection = ConnectionHandle::new("test-connection");
    let collector = Arc::new(collector);

    let task = {
        let connection = connection.clone();
        let collector = Arc::clone(&collector);
        tokio::spawn(async move { handler.serve(server_io, connection, collector).await })
    };

    (
        client_io,
        ServerSide {
            connection,
            collector,
            task,
        },
    )
}
