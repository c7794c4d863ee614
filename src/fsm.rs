use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::messages::USER_SPACE_START;

/// Declarative on-disk form of a per-role state machine.
///
/// ```json
/// { "states": [
///     { "name": "pre_auth", "allowed": [1], "onReceived": { "1": "handshaking" } },
///     { "name": "handshaking", "allowed": [1] },
///     { "name": "open", "allowed": [5, 6, 7, 8], "allowUserSpace": true }
/// ] }
/// ```
///
/// The first state is the initial state. Explicit transitions
///  ([ConnectionFsm::move_to_next_state]) walk the array in order; implicit
///  transitions fire when a state's `onReceived` table names the observed
///  message type.
#[derive(Debug, Deserialize)]
struct FsmSpec {
    states: Vec<StateSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateSpec {
    name: String,
    #[serde(default)]
    allowed: Vec<u32>,
    #[serde(default)]
    allow_user_space: bool,
    #[serde(default)]
    on_received: FxHashMap<u32, String>,
}

#[derive(Debug)]
struct FsmState {
    name: String,
    allowed: FxHashSet<u32>,
    allow_user_space: bool,
    on_received: FxHashMap<u32, usize>,
}

/// Immutable per-role template, loaded once at startup. Connections never
///  share mutable state machine data: each one gets a [ConnectionFsm], which
///  is just an `Arc` of the template plus its own state index.
#[derive(Debug)]
pub struct FsmTemplate {
    states: Vec<FsmState>,
}

impl FsmTemplate {
    pub fn load(raw: &[u8]) -> anyhow::Result<Arc<FsmTemplate>> {
        let spec: FsmSpec = serde_json::from_slice(raw).context("parsing FSM description")?;

        if spec.states.is_empty() {
            bail!("FSM description declares no states");
        }

        let mut index_by_name = FxHashMap::default();
        for (index, state) in spec.states.iter().enumerate() {
            if index_by_name.insert(state.name.clone(), index).is_some() {
                bail!("duplicate FSM state name {:?}", state.name);
            }
        }

        let mut states = Vec::with_capacity(spec.states.len());
        for state in spec.states {
            let mut on_received = FxHashMap::default();
            for (msg_type, target) in state.on_received {
                match index_by_name.get(&target) {
                    Some(&target_index) => {
                        on_received.insert(msg_type, target_index);
                    }
                    None => bail!(
                        "FSM state {:?} transitions to undeclared state {:?} on message type {}",
                        state.name,
                        target,
                        msg_type
                    ),
                }
            }

            states.push(FsmState {
                name: state.name,
                allowed: state.allowed.into_iter().collect(),
                allow_user_space: state.allow_user_space,
                on_received,
            });
        }

        Ok(Arc::new(FsmTemplate { states }))
    }

    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Arc<FsmTemplate>> {
        let path = path.as_ref();
        let raw =
            std::fs::read(path).with_context(|| format!("reading FSM description {:?}", path))?;
        FsmTemplate::load(&raw).with_context(|| format!("loading FSM description {:?}", path))
    }

    pub fn initial_state_name(&self) -> &str {
        &self.states[0].name
    }

    pub fn instantiate(self: &Arc<FsmTemplate>) -> ConnectionFsm {
        ConnectionFsm {
            template: self.clone(),
            current: 0,
        }
    }
}

/// The per-connection cursor over an [FsmTemplate]. Not shareable; it is
///  touched only from the owning connection's receive path and from
///  authentication, which the connection serializes.
#[derive(Debug, Clone)]
pub struct ConnectionFsm {
    template: Arc<FsmTemplate>,
    current: usize,
}

impl ConnectionFsm {
    fn state(&self) -> &FsmState {
        &self.template.states[self.current]
    }

    pub fn is_allowed(&self, msg_type: u32) -> bool {
        let state = self.state();
        state.allowed.contains(&msg_type)
            || (state.allow_user_space && msg_type >= USER_SPACE_START)
    }

    /// Observing a message may advance the state, as declared by the
    ///  template's `onReceived` tables.
    pub fn on_received(&mut self, msg_type: u32) {
        if let Some(&target) = self.state().on_received.get(&msg_type) {
            self.current = target;
        }
    }

    /// Explicit linear progression; returns false when the current state has
    ///  no successor.
    pub fn move_to_next_state(&mut self) -> bool {
        if self.current + 1 < self.template.states.len() {
            self.current += 1;
            true
        } else {
            false
        }
    }

    pub fn current_state_name(&self) -> &str {
        &self.state().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn template() -> Arc<FsmTemplate> {
        FsmTemplate::load(
            br#"{ "states": [
                { "name": "pre_auth", "allowed": [1], "onReceived": { "1": "handshaking" } },
                { "name": "handshaking", "allowed": [1] },
                { "name": "open", "allowed": [5, 6], "allowUserSpace": true }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state() {
        let fsm = template().instantiate();
        assert_eq!(fsm.current_state_name(), "pre_auth");
    }

    #[rstest]
    #[case::auth_allowed(1, true)]
    #[case::sub_rejected(5, false)]
    #[case::user_space_rejected(100, false)]
    fn test_is_allowed_initial(#[case] msg_type: u32, #[case] expected: bool) {
        let fsm = template().instantiate();
        assert_eq!(fsm.is_allowed(msg_type), expected);
    }

    #[test]
    fn test_on_received_transition() {
        let mut fsm = template().instantiate();
        // unmapped types leave the state alone
        fsm.on_received(99);
        assert_eq!(fsm.current_state_name(), "pre_auth");

        fsm.on_received(1);
        assert_eq!(fsm.current_state_name(), "handshaking");

        // the transition is declared on pre_auth only
        fsm.on_received(1);
        assert_eq!(fsm.current_state_name(), "handshaking");
    }

    #[test]
    fn test_move_to_next_state_exhaustion() {
        let mut fsm = template().instantiate();
        assert!(fsm.move_to_next_state());
        assert!(fsm.move_to_next_state());
        assert_eq!(fsm.current_state_name(), "open");
        assert!(!fsm.move_to_next_state());
        assert_eq!(fsm.current_state_name(), "open");
    }

    #[test]
    fn test_user_space_gate() {
        let mut fsm = template().instantiate();
        fsm.on_received(1);
        assert!(fsm.move_to_next_state());
        assert!(fsm.is_allowed(5));
        assert!(fsm.is_allowed(100));
        assert!(fsm.is_allowed(70000));
        assert!(!fsm.is_allowed(7));
    }

    #[test]
    fn test_cursors_are_independent() {
        let template = template();
        let mut a = template.instantiate();
        let b = template.instantiate();

        a.on_received(1);
        assert_eq!(a.current_state_name(), "handshaking");
        assert_eq!(b.current_state_name(), "pre_auth");
        assert_eq!(template.initial_state_name(), "pre_auth");
    }

    #[rstest]
    #[case::no_states(r#"{ "states": [] }"#)]
    #[case::duplicate_names(
        r#"{ "states": [ { "name": "a" }, { "name": "a" } ] }"#
    )]
    #[case::dangling_transition(
        r#"{ "states": [ { "name": "a", "onReceived": { "1": "nowhere" } } ] }"#
    )]
    #[case::not_json("state machine?")]
    fn test_invalid_descriptions(#[case] raw: &str) {
        assert!(FsmTemplate::load(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_load_file_missing() {
        assert!(FsmTemplate::load_file("/nonexistent/fsm.json").is_err());
    }
}
