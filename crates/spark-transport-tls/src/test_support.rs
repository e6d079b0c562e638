use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustls::{
    ServerConfig,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
};

use crate::{
    error::TlsHandlerError,
    pipeline::{InboundHandler, PipelineContext, TlsUserEvent},
};

/// 生成仅用于测试的自签名服务端配置。
pub(crate) fn server_config() -> Arc<ServerConfig> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed certificate");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("protocol versions")
    .with_no_client_auth()
    .with_single_cert(vec![cert.der().clone()], key)
    .expect("server config");
    Arc::new(config)
}

#[derive(Clone, Debug)]
pub(crate) enum Recorded {
    Active,
    Read(Bytes),
    Event(TlsUserEvent),
    Error(TlsHandlerError),
    Inactive,
}

/// 记录所有管道事件的下游 Handler。
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    pub(crate) fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<TlsHandlerError> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn handshake_failures(&self) -> usize {
        self.errors()
            .iter()
            .filter(|error| error.is_handshake_failure())
            .count()
    }
}

impl InboundHandler for Recorder {
    fn on_channel_active(&self, _ctx: &PipelineContext) {
        self.events.lock().push(Recorded::Active);
    }

    fn on_read(&self, _ctx: &PipelineContext, msg: Bytes) {
        self.events.lock().push(Recorded::Read(msg));
    }

    fn on_user_event(&self, _ctx: &PipelineContext, event: TlsUserEvent) {
        self.events.lock().push(Recorded::Event(event));
    }

    fn on_exception_caught(&self, _ctx: &PipelineContext, error: TlsHandlerError) {
        self.events.lock().push(Recorded::Error(error));
    }

    fn on_channel_inactive(&self, _ctx: &PipelineContext) {
        self.events.lock().push(Recorded::Inactive);
    }
}
