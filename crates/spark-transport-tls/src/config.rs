use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::callback::{HandshakeErrorCallback, PeerVerificationCallback};

/// 读缓冲的上限，防止配置把单连接内存放大到失控。
const MAX_READ_BUFFER_SIZE: usize = 1 << 20;

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 解析失败。
    #[error("invalid tls handler options: {0}")]
    Parse(#[from] toml::de::Error),
    /// 字段取值越界。
    #[error("tls handler option `{field}` is out of range: {reason}")]
    OutOfRange {
        /// 字段名。
        field: &'static str,
        /// 越界说明。
        reason: String,
    },
}

/// 处理器特性开关。
///
/// # 契约（What）
/// - `flush_alert_on_failure`：协议失败后先把 `rustls` 排队的告警写给对端，再释放引擎；
/// - `send_close_notify`：会话正常结束时发送 `close_notify`；
/// - `read_buffer_size`：单次从底层流读取的最大字节数，取值范围 `1..=1 MiB`。
///
/// 可从 TOML 加载，缺省字段使用 [`Default`] 的取值：
///
/// ```rust
/// use spark_transport_tls::TlsHandlerOptions;
///
/// let options = TlsHandlerOptions::from_toml_str("read_buffer_size = 4096").unwrap();
/// assert_eq!(options.read_buffer_size, 4096);
/// assert!(options.flush_alert_on_failure);
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsHandlerOptions {
    /// 失败时刷出 TLS 告警。
    pub flush_alert_on_failure: bool,
    /// 正常结束时发送 `close_notify`。
    pub send_close_notify: bool,
    /// 单次读取缓冲大小。
    pub read_buffer_size: usize,
}

impl Default for TlsHandlerOptions {
    fn default() -> Self {
        Self {
            flush_alert_on_failure: true,
            send_close_notify: true,
            read_buffer_size: 16 * 1024,
        }
    }
}

impl TlsHandlerOptions {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: TlsHandlerOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 || self.read_buffer_size > MAX_READ_BUFFER_SIZE {
            return Err(ConfigError::OutOfRange {
                field: "read_buffer_size",
                reason: format!(
                    "{} not in 1..={MAX_READ_BUFFER_SIZE}",
                    self.read_buffer_size
                ),
            });
        }
        Ok(())
    }
}

/// 处理器构造后即不可变的配置：特性开关加上可选回调。
///
/// 跨连接共享时以 `Arc` 持有，所有连接并发只读。
#[derive(Clone, Default)]
pub struct TlsHandlerConfiguration {
    options: TlsHandlerOptions,
    handshake_error_callback: Option<HandshakeErrorCallback>,
    peer_verification: Option<PeerVerificationCallback>,
}

impl TlsHandlerConfiguration {
    /// 创建构建器。
    pub fn builder() -> TlsHandlerConfigurationBuilder {
        TlsHandlerConfigurationBuilder::default()
    }

    /// 特性开关。
    pub fn options(&self) -> &TlsHandlerOptions {
        &self.options
    }

    /// 自定义握手错误回调。
    pub fn handshake_error_callback(&self) -> Option<&HandshakeErrorCallback> {
        self.handshake_error_callback.as_ref()
    }

    /// 自定义对端校验回调。
    pub fn peer_verification(&self) -> Option<&PeerVerificationCallback> {
        self.peer_verification.as_ref()
    }
}

impl fmt::Debug for TlsHandlerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandlerConfiguration")
            .field("options", &self.options)
            .field(
                "handshake_error_callback",
                &self.handshake_error_callback.is_some(),
            )
            .field("peer_verification", &self.peer_verification.is_some())
            .finish()
    }
}

/// [`TlsHandlerConfiguration`] 的构建器。
#[derive(Default)]
pub struct TlsHandlerConfigurationBuilder {
    options: TlsHandlerOptions,
    handshake_error_callback: Option<HandshakeErrorCallback>,
    peer_verification: Option<PeerVerificationCallback>,
}

impl TlsHandlerConfigurationBuilder {
    /// 设置特性开关。
    pub fn with_options(mut self, options: TlsHandlerOptions) -> Self {
        self.options = options;
        self
    }

    /// 注册自定义握手错误回调，重复注册时后者覆盖前者。
    pub fn with_handshake_error_callback(mut self, callback: HandshakeErrorCallback) -> Self {
        self.handshake_error_callback = Some(callback);
        self
    }

    /// 注册自定义对端校验回调。
    pub fn with_peer_verification(mut self, callback: PeerVerificationCallback) -> Self {
        self.peer_verification = Some(callback);
        self
    }

    /// 校验并生成不可变配置。
    pub fn build(self) -> Result<TlsHandlerConfiguration, ConfigError> {
        self.options.validate()?;
        Ok(TlsHandlerConfiguration {
            options: self.options,
            handshake_error_callback: self.handshake_error_callback,
            peer_verification: self.peer_verification,
        })
    }
}

/// TLS 服务端配置的热更新容器。
///
/// # 设计动机（Why）
/// - 证书轮换不应中断监听或已建立的连接；
/// - 借助 `ArcSwap` 的“读无锁、写常数时间”特性实现 RCU 式配置广播。
///
/// # 核心契约（What）
/// - 每条新连接在创建 `rustls` 会话前读取一次快照；
/// - `replace` 立即对后续连接可见，已有连接继续持有各自的 `Arc<ServerConfig>`。
#[derive(Clone)]
pub struct HotReloadingServerConfig {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl HotReloadingServerConfig {
    /// 基于已有的 `Arc<ServerConfig>` 构造热更容器。
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    /// 获取当前配置的共享快照。
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// 用新的配置替换当前快照，并返回旧值。
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }
}

impl fmt::Debug for HotReloadingServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadingServerConfig")
            .finish_non_exhaustive()
    }
}
