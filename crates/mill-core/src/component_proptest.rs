#[cfg(test)]
mod proptest_components {
    use crate::idle_shutdown::{self, IdleInputs, IdleParams, IdleState};
    use crate::oiler::{self, OilerInputs, OilerParams, OilerPhase, OilerState, TriggerCause};
    use proptest::prelude::*;
    use std::time::Duration;

    const TICK: Duration = Duration::from_secs(1);

    fn oiler_inputs() -> impl Strategy<Value = OilerInputs> {
        (0.0f32..200.0, 0.0f32..5.0, any::<bool>(), any::<bool>()).prop_map(
            |(x, velocity, all_homed, manual_trigger)| OilerInputs {
                position: [x, 0.0, 0.0],
                velocity,
                all_homed,
                manual_trigger,
            },
        )
    }

    fn idle_inputs() -> impl Strategy<Value = IdleInputs> {
        (
            prop_oneof![Just(0.0f32), -10.0f32..10.0],
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(velocity, program_running, program_paused, spindle_on, user_activity, machine_on)| {
                    IdleInputs {
                        velocity,
                        program_running,
                        program_paused,
                        spindle_on,
                        user_activity,
                        machine_on,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // A pulse starts only from IDLE, and the pump follows the phase.
        #[test]
        fn pump_starts_only_from_idle(
            inputs in prop::collection::vec(oiler_inputs(), 1..200),
            distance in 1.0f32..500.0,
            pump in 0.0f32..5.0,
            lockout in 0.0f32..10.0,
        ) {
            let params = OilerParams {
                distance_threshold: distance,
                time_threshold: 20.0,
                pump_duration: pump,
                lockout_duration: lockout,
            };
            let mut state = OilerState::default();
            for input in &inputs {
                let before = state.phase();
                let out = oiler::advance(&mut state, &params, input, TICK);
                if out.fired.is_some() {
                    prop_assert_eq!(before, OilerPhase::Idle);
                    prop_assert_eq!(state.phase(), OilerPhase::Pumping);
                } else if before == OilerPhase::Idle {
                    prop_assert_eq!(state.phase(), OilerPhase::Idle);
                }
                if before == OilerPhase::Lockout {
                    prop_assert!(out.fired.is_none());
                }
                prop_assert_eq!(out.pump, state.phase() == OilerPhase::Pumping);
            }
        }

        // Accumulators restart at every pulse, and an idle oiler never sits on
        // a crossed threshold without firing.
        #[test]
        fn distance_crossing_fires_once(
            steps in prop::collection::vec(0.1f32..20.0, 1..300),
            threshold in 10.0f32..400.0,
        ) {
            let params = OilerParams {
                distance_threshold: threshold,
                time_threshold: 1.0e6,
                pump_duration: 1.0,
                lockout_duration: 1.0,
            };
            let mut state = OilerState::default();
            let mut x = 0.0f32;
            for step in &steps {
                let input = OilerInputs {
                    position: [x, 0.0, 0.0],
                    velocity: 1.0,
                    all_homed: false,
                    manual_trigger: false,
                };
                let before = state.phase();
                let out = oiler::advance(&mut state, &params, &input, TICK);
                match out.fired {
                    Some(cause) => {
                        prop_assert_eq!(cause, TriggerCause::Distance);
                        prop_assert_eq!(state.distance(), 0.0);
                    }
                    None if before == OilerPhase::Idle => {
                        prop_assert!(state.distance() < f64::from(threshold));
                    }
                    None => {}
                }
                x += step;
            }
        }

        // Homing lubrication fires exactly on a rising edge of all-homed seen
        // from IDLE, and on no other tick.
        #[test]
        fn homing_fires_once_per_edge(
            homed in prop::collection::vec(any::<bool>(), 1..200),
            lockout in 0.0f32..5.0,
        ) {
            let params = OilerParams {
                distance_threshold: 1.0e6,
                time_threshold: 1.0e6,
                pump_duration: 1.0,
                lockout_duration: lockout,
            };
            let mut state = OilerState::default();
            let mut prev = false;
            for (tick, &h) in homed.iter().enumerate() {
                let edge = h && !prev;
                prev = h;
                let before = state.phase();
                let input = OilerInputs { all_homed: h, ..OilerInputs::default() };
                let fired = oiler::advance(&mut state, &params, &input, TICK).fired
                    == Some(TriggerCause::Homing);
                prop_assert_eq!(
                    fired,
                    edge && before == OilerPhase::Idle,
                    "tick {}: homed={} edge={} phase={:?}", tick, h, edge, before
                );
            }
        }

        // With no activity the timer asserts shutdown on exactly the timeout tick.
        #[test]
        fn idle_shutdown_on_timeout_tick(timeout_s in 1u32..120) {
            let params = IdleParams { timeout_s };
            let mut state = IdleState::default();
            let input = IdleInputs { machine_on: true, ..IdleInputs::default() };
            for tick in 1..=timeout_s + 5 {
                let out = idle_shutdown::advance(&mut state, &params, &input, TICK);
                prop_assert_eq!(out.shutdown, tick >= timeout_s);
                prop_assert_eq!(out.timed_out, tick == timeout_s);
            }
        }

        // A paused programme holds the machine on indefinitely.
        #[test]
        fn paused_program_never_shuts_down(
            inputs in prop::collection::vec(idle_inputs(), 1..300),
            timeout_s in 1u32..10,
        ) {
            let params = IdleParams { timeout_s };
            let mut state = IdleState::default();
            for input in &inputs {
                let input = IdleInputs { program_paused: true, machine_on: true, ..*input };
                let out = idle_shutdown::advance(&mut state, &params, &input, TICK);
                prop_assert!(!out.shutdown);
                prop_assert!(!out.idle);
            }
        }

        // Power loss clears every output and the elapsed time on the same tick.
        #[test]
        fn machine_off_resets_timer(
            inputs in prop::collection::vec(idle_inputs(), 1..300),
            timeout_s in 1u32..10,
        ) {
            let params = IdleParams { timeout_s };
            let mut state = IdleState::default();
            for input in &inputs {
                let out = idle_shutdown::advance(&mut state, &params, input, TICK);
                if !input.machine_on {
                    prop_assert!(!out.shutdown && !out.idle && !out.timed_out);
                    prop_assert_eq!(state.idle_elapsed(), Duration::ZERO);
                }
                if input.is_active() {
                    prop_assert!(!out.idle);
                }
            }
        }
    }
}
