use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    callback::{
        CallbackOutcome, CustomErrorCallbackInvoker, HandshakeErrorCallback,
        HandshakeFailureContext,
    },
    classifier::{HandshakeErrorClassifier, HandshakeFailure},
    engine::TlsEngine,
    pipeline::{InboundHandler, Pipeline},
    propagator::{FallbackErrorPropagator, Propagation},
};

/// 单次握手尝试的状态。
///
/// ```text
/// Active ──► Established ──► Propagated
///   │  └──────────────────────► Propagated
///   └──► Failing ──► Intercepted | Propagated
/// ```
///
/// `Intercepted` 与 `Propagated` 为终态；除上图列出的转换外，其余转换一律被拒绝，
/// 单次分派因此可以在类型层面被检查，而不依赖零散的布尔标记。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// 握手进行中，尚无失败。
    Active,
    /// 握手成功，会话已建立。
    Established,
    /// 自定义回调执行中，该连接的其它事件被挂起。
    Failing,
    /// 回调接管了失败，默认错误路径被永久抑制。
    Intercepted,
    /// 标准错误已沿管道投递。
    Propagated,
}

impl HandshakeState {
    /// 是否为终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Intercepted | HandshakeState::Propagated)
    }

    /// 校验并执行一次状态转换。
    pub fn transition(self, next: HandshakeState) -> Result<HandshakeState, InvalidTransition> {
        use HandshakeState::*;
        match (self, next) {
            (Active, Established)
            | (Active, Failing)
            | (Active, Propagated)
            | (Established, Propagated)
            | (Failing, Intercepted)
            | (Failing, Propagated) => Ok(next),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 非法的状态转换。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid handshake state transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// 转换前的状态。
    pub from: HandshakeState,
    /// 被拒绝的目标状态。
    pub to: HandshakeState,
}

/// 一次失败的最终裁决。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// 回调接管。
    Intercepted,
    /// 兜底传播。
    Propagated(Propagation),
}

/// 编排分类器、回调执行器与兜底传播器。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 失败不可拦截（握手之后）→ 直接 `Propagated`，回调不被咨询；
/// 2. 可拦截但未注册回调 → 直接 `Propagated`；
/// 3. 可拦截且注册了回调 → `Failing`，等待回调：
///    - 成功 → `Intercepted`，不投递任何错误；
///    - 失败 → `Propagated`，以原始失败（而非回调的错误）投递。
///
/// ## 契约（What）
/// - 协调器由连接的驱动任务独占（`&mut self`），所有转换都在同一执行上下文中串行发生；
/// - 对同一次握手尝试的第二次失败上报返回 [`InvalidTransition`]，不会造成重复投递或重复拆除。
pub(crate) struct HandshakeErrorCoordinator {
    state: HandshakeState,
    classifier: HandshakeErrorClassifier,
    invoker: Option<CustomErrorCallbackInvoker>,
    propagator: FallbackErrorPropagator,
}

impl HandshakeErrorCoordinator {
    /// 以可选回调创建处于 `Active` 状态的协调器。
    pub(crate) fn new(callback: Option<HandshakeErrorCallback>) -> Self {
        Self {
            state: HandshakeState::Active,
            classifier: HandshakeErrorClassifier,
            invoker: callback.map(CustomErrorCallbackInvoker::new),
            propagator: FallbackErrorPropagator,
        }
    }

    /// 当前状态。
    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    fn advance(&mut self, next: HandshakeState) -> Result<(), InvalidTransition> {
        let previous = self.state;
        self.state = previous.transition(next)?;
        tracing::trace!(from = %previous, to = %next, "handshake state transition");
        Ok(())
    }

    pub(crate) fn on_handshake_completed(&mut self) -> Result<(), InvalidTransition> {
        self.advance(HandshakeState::Established)
    }

    pub(crate) async fn on_failure<H: InboundHandler>(
        &mut self,
        failure: HandshakeFailure,
        context: HandshakeFailureContext,
        pipeline: &Pipeline<H>,
        engine: &mut TlsEngine,
    ) -> Result<Resolution, InvalidTransition> {
        if matches!(self.state, HandshakeState::Failing) || self.state.is_terminal() {
            return Err(InvalidTransition {
                from: self.state,
                to: HandshakeState::Failing,
            });
        }

        let invoker = match (&self.invoker, self.classifier.is_interceptable(&failure)) {
            (Some(invoker), true) => invoker.clone(),
            (_, interceptable) => {
                tracing::debug!(
                    phase = %failure.phase(),
                    interceptable,
                    "tls failure takes the default error path"
                );
                self.advance(HandshakeState::Propagated)?;
                let propagation = self.propagator.propagate(&failure, pipeline, engine);
                return Ok(Resolution::Propagated(propagation));
            }
        };

        self.advance(HandshakeState::Failing)?;
        match invoker.invoke(&failure, context).await {
            CallbackOutcome::Handled => {
                self.advance(HandshakeState::Intercepted)?;
                // 失败后的会话不可再用，拦截路径同样释放引擎，但不投递任何错误。
                engine.release();
                tracing::debug!("handshake failure intercepted by custom callback");
                Ok(Resolution::Intercepted)
            }
            CallbackOutcome::Unhandled(raw) => {
                debug_assert!(Arc::ptr_eq(&raw, failure.raw()));
                self.advance(HandshakeState::Propagated)?;
                tracing::debug!("custom callback declined, falling back to default error path");
                let propagation = self.propagator.propagate(&failure, pipeline, engine);
                Ok(Resolution::Propagated(propagation))
            }
        }
    }
}

impl fmt::Debug for HandshakeErrorCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeErrorCoordinator")
            .field("state", &self.state)
            .field("callback", &self.invoker.is_some())
            .finish()
    }
}
