//! Service-pin LED state (spec.md §4.1 `set_service_pin_state`, §7
//! "User-visible failure").

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePinState {
    Off,
    On,
    Blinking,
    Flickering,
}

/// Derives the LED state from node state, per spec.md §7: "blinking for
/// unconfigured, on for applicationless, off for configured". Hard
/// offline and a momentary service-pin press/flicker are driven
/// separately by the caller (they're not a function of node state
/// alone).
pub fn led_for_node_state(state: crate::tables::config_data::NodeState) -> ServicePinState {
    use crate::tables::config_data::NodeState::*;
    match state {
        Unconfigured => ServicePinState::Blinking,
        Applicationless => ServicePinState::On,
        Configured => ServicePinState::Off,
        HardOffline => ServicePinState::Off,
    }
}
