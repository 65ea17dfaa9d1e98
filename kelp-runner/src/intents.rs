//! Operator trigger state for build, sync and deploy.
//!
//! Each category has a due flag ("fire on the next poll") and an auto flag
//! ("fire every poll"). Resetting a category restores its due flag to the auto
//! flag, so a one-shot `set_*(true)` fires once under manual mode and an
//! operator can switch modes without the loop knowing which one is active.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use kelp_core::Category;

/// Atomic view of the due flags for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentSnapshot {
    pub build: bool,
    pub sync: bool,
    pub deploy: bool,
}

impl IntentSnapshot {
    pub fn get(&self, category: Category) -> bool {
        match category {
            Category::Build => self.build,
            Category::Sync => self.sync,
            Category::Deploy => self.deploy,
        }
    }
}

/// Auto-trigger policy, reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSnapshot {
    pub build: bool,
    pub sync: bool,
    pub deploy: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flag {
    due: bool,
    auto: bool,
}

impl Flag {
    fn new(auto: bool) -> Self {
        Self { due: auto, auto }
    }

    fn reset(&mut self) {
        self.due = self.auto;
    }
}

#[derive(Debug, Default)]
struct State {
    build: Flag,
    sync: Flag,
    deploy: Flag,
}

impl State {
    fn flag_mut(&mut self, category: Category) -> &mut Flag {
        match category {
            Category::Build => &mut self.build,
            Category::Sync => &mut self.sync,
            Category::Deploy => &mut self.deploy,
        }
    }
}

#[derive(Debug, Default)]
pub struct Intents {
    state: Mutex<State>,
}

impl Intents {
    /// Due flags start at their auto values.
    pub fn new(auto_build: bool, auto_sync: bool, auto_deploy: bool) -> Self {
        Self {
            state: Mutex::new(State {
                build: Flag::new(auto_build),
                sync: Flag::new(auto_sync),
                deploy: Flag::new(auto_deploy),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset every category to its auto baseline.
    pub fn reset(&self) {
        let mut state = self.state();
        state.build.reset();
        state.sync.reset();
        state.deploy.reset();
    }

    pub fn reset_build(&self) {
        self.state().build.reset();
    }

    pub fn reset_sync(&self) {
        self.state().sync.reset();
    }

    pub fn reset_deploy(&self) {
        self.state().deploy.reset();
    }

    pub fn set_build(&self, due: bool) {
        self.state().build.due = due;
    }

    pub fn set_sync(&self, due: bool) {
        self.state().sync.due = due;
    }

    pub fn set_deploy(&self, due: bool) {
        self.state().deploy.due = due;
    }

    pub fn set(&self, category: Category, due: bool) {
        self.state().flag_mut(category).due = due;
    }

    /// Flip the auto policy and move the due flag to the new baseline in one step.
    pub fn set_auto(&self, category: Category, auto: bool) {
        let mut state = self.state();
        let flag = state.flag_mut(category);
        flag.auto = auto;
        flag.reset();
    }

    pub fn auto_build(&self) -> bool {
        self.state().build.auto
    }

    pub fn auto_sync(&self) -> bool {
        self.state().sync.auto
    }

    pub fn auto_deploy(&self) -> bool {
        self.state().deploy.auto
    }

    pub fn get_intents(&self) -> IntentSnapshot {
        let state = self.state();
        IntentSnapshot {
            build: state.build.due,
            sync: state.sync.due,
            deploy: state.deploy.due,
        }
    }

    pub fn get_auto(&self) -> AutoSnapshot {
        let state = self.state();
        AutoSnapshot {
            build: state.build.auto,
            sync: state.sync.auto,
            deploy: state.deploy.auto,
        }
    }

    /// Whether polling can ever fire without an explicit trigger.
    pub fn is_any_auto_enabled(&self) -> bool {
        let state = self.state();
        state.build.auto || state.sync.auto || state.deploy.auto
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[test]
    fn new_starts_due_at_auto_values() {
        let intents = Intents::new(true, false, true);
        assert_eq!(
            intents.get_intents(),
            IntentSnapshot {
                build: true,
                sync: false,
                deploy: true
            }
        );
    }

    #[rstest]
    #[case::auto_restores_true(true, false, true)]
    #[case::manual_clears_one_shot(false, true, false)]
    #[case::auto_keeps_true(true, true, true)]
    #[case::manual_stays_false(false, false, false)]
    fn reset_build_falls_back_to_auto(
        #[case] auto: bool,
        #[case] set_to: bool,
        #[case] expected: bool,
    ) {
        let intents = Intents::new(auto, false, false);
        intents.set_build(set_to);
        assert_eq!(intents.get_intents().build, set_to);

        intents.reset_build();
        assert_eq!(intents.get_intents().build, expected);
    }

    #[rstest]
    #[case(Category::Build)]
    #[case(Category::Sync)]
    #[case(Category::Deploy)]
    fn one_shot_trigger_fires_once_in_manual_mode(#[case] category: Category) {
        let intents = Intents::new(false, false, false);
        intents.set(category, true);
        assert!(intents.get_intents().get(category));

        intents.reset();
        assert!(!intents.get_intents().get(category));
    }

    #[test]
    fn resets_are_category_scoped() {
        let intents = Intents::new(false, false, false);
        intents.set_build(true);
        intents.set_sync(true);
        intents.set_deploy(true);

        intents.reset_sync();
        assert_eq!(
            intents.get_intents(),
            IntentSnapshot {
                build: true,
                sync: false,
                deploy: true
            }
        );

        intents.reset();
        assert_eq!(
            intents.get_intents(),
            IntentSnapshot {
                build: false,
                sync: false,
                deploy: false
            }
        );
    }

    #[test]
    fn set_auto_moves_due_flag_to_new_baseline() {
        let intents = Intents::new(true, true, true);
        intents.set_auto(Category::Deploy, false);
        assert!(!intents.auto_deploy());
        assert!(!intents.get_intents().deploy);

        intents.set_auto(Category::Deploy, true);
        assert!(intents.get_intents().deploy);
    }

    #[rstest]
    #[case(false, false, false, false)]
    #[case(true, false, false, true)]
    #[case(false, true, false, true)]
    #[case(false, false, true, true)]
    fn any_auto_enabled(
        #[case] build: bool,
        #[case] sync: bool,
        #[case] deploy: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(
            Intents::new(build, sync, deploy).is_any_auto_enabled(),
            expected
        );
    }

    #[test]
    fn concurrent_writers_leave_consistent_state() {
        let intents = Arc::new(Intents::new(false, false, false));
        let handles: Vec<_> = Category::ALL
            .into_iter()
            .map(|category| {
                let intents = Arc::clone(&intents);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        intents.set(category, i % 2 == 0);
                        let _ = intents.get_intents();
                    }
                    intents.set(category, true);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        assert_eq!(
            intents.get_intents(),
            IntentSnapshot {
                build: true,
                sync: true,
                deploy: true
            }
        );
    }
}
