//! HandshakeState 状态机性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：握手错误协调器依赖 `HandshakeState::transition` 保证“单次分派”：
//!   每次握手尝试至多落入一个终态（`Intercepted` 或 `Propagated`），且终态不可离开。
//!   这里用随机转换序列驱动真实状态机，验证该性质在任意输入下都成立。
//! - **设计手法 (How)**：Proptest 生成任意长度的目标状态序列，依次尝试转换；被拒绝的转换不改变状态，
//!   与协调器在生产路径上的行为一致（拒绝后记录日志并保持原状态）。
//!
//! # 合同与边界 (What)
//!
//! - **输入**：从 `Active` 出发的随机目标序列，允许包含任意非法转换；
//! - **断言**：
//!   1. 序列执行过程中进入终态的次数不超过一次；
//!   2. 进入终态后所有转换都被拒绝；
//!   3. `Intercepted` 只能从 `Failing` 到达，即必然经过一次回调。

use proptest::prelude::*;
use spark_transport_tls::HandshakeState;

const STATES: [HandshakeState; 5] = [
    HandshakeState::Active,
    HandshakeState::Established,
    HandshakeState::Failing,
    HandshakeState::Intercepted,
    HandshakeState::Propagated,
];

fn any_state() -> impl Strategy<Value = HandshakeState> {
    (0..STATES.len()).prop_map(|index| STATES[index])
}

proptest! {
    #[test]
    fn prop_terminal_state_is_reached_at_most_once(
        targets in prop::collection::vec(any_state(), 0..32),
    ) {
        let mut state = HandshakeState::Active;
        let mut terminal_entries = 0usize;

        for target in targets {
            let was_terminal = state.is_terminal();
            match state.transition(target) {
                Ok(next) => {
                    prop_assert!(!was_terminal, "终态 {state} 不应再转换到 {next}");
                    if next.is_terminal() {
                        terminal_entries += 1;
                    }
                    state = next;
                }
                Err(invalid) => {
                    prop_assert_eq!(invalid.from, state);
                    prop_assert_eq!(invalid.to, target);
                }
            }
        }

        prop_assert!(terminal_entries <= 1);
    }

    #[test]
    fn prop_intercepted_requires_failing(from in any_state()) {
        let accepted = from.transition(HandshakeState::Intercepted).is_ok();
        prop_assert_eq!(accepted, from == HandshakeState::Failing);
    }
}
