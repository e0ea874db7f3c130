//! Hash strength controller.
//!
//! At every round boundary the engine weighs what sampling saved (`pos`)
//! against what collisions cost (`neg`) and steps the hash strength
//! accordingly. When the benefit drifts with no clear direction, the
//! controller probes downward then upward around the last stable point and
//! commits to whichever turning point paid better. Any strength change
//! forces a delta-rehash of the stable tree.

use crate::engine::Uksm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RshashState {
    New,
    Still,
    TryDown,
    TryUp,
    PreStill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Obscure,
    Still,
}

pub struct RshashTune {
    pub state: RshashState,
    pub pre_direct: Direction,
    pub below_count: u8,
    /// Lookup window of size 5; three below-stable ticks inside one window
    /// end the probe.
    pub lookup_window_index: u8,
    pub stable_benefit: u64,
    pub turn_point_down: usize,
    pub turn_benefit_down: u64,
    pub turn_point_up: usize,
    pub turn_benefit_up: u64,
    pub stable_point: usize,
    pub neg_cont_zero: u32,
    pub cont_obscure: u32,
}

impl RshashTune {
    pub fn new() -> Self {
        Self {
            state: RshashState::New,
            pre_direct: Direction::Still,
            below_count: 0,
            lookup_window_index: 0,
            stable_benefit: 0,
            turn_point_down: 0,
            turn_benefit_down: 0,
            turn_point_up: 0,
            turn_benefit_up: 0,
            stable_point: 0,
            neg_cont_zero: 0,
            cont_obscure: 0,
        }
    }
}

impl Uksm {
    fn current_neg_ratio(&self) -> u64 {
        if self.hash.pos == 0 || self.hash.neg > self.hash.pos {
            return 100;
        }
        100 * self.hash.neg / self.hash.pos
    }

    fn current_benefit(&self) -> u64 {
        if self.hash.neg > self.hash.pos {
            return 0;
        }
        let scanned = self.stats.scanned_this_round();
        if scanned == 0 {
            return 0;
        }
        (self.hash.pos - self.hash.neg) / scanned
    }

    fn judge_rshash_direction(&mut self) -> Direction {
        let neg_ratio = self.current_neg_ratio();

        if neg_ratio == 0 {
            self.tune.neg_cont_zero += 1;
            if self.tune.neg_cont_zero > 2 {
                return Direction::Down;
            }
            return Direction::Still;
        }
        self.tune.neg_cont_zero = 0;

        if neg_ratio > 90 {
            self.tune.cont_obscure = 0;
            return Direction::Up;
        }

        // re-probe on a fixed cadence in case the system sat still too long
        if self.scan_round % 1024 == 3 {
            self.tune.cont_obscure = 0;
            return Direction::Obscure;
        }

        let current = self.current_benefit();
        let stable = self.tune.stable_benefit;
        if stable == 0 {
            self.tune.cont_obscure = 0;
            return Direction::Obscure;
        }

        let delta = current.abs_diff(stable);
        let drift = 100 * delta / stable;
        if drift > 50 {
            self.tune.cont_obscure += 1;
            if self.tune.cont_obscure > 2 {
                return Direction::Obscure;
            }
            return Direction::Still;
        }

        self.tune.cont_obscure = 0;
        Direction::Still
    }

    /// Drive the state machine at the round boundary, then reset the cost
    /// counters and rebuild the stable tree if the strength moved.
    pub(crate) fn rshash_adjust(&mut self) {
        if self.stats.pages_scanned == self.stats.pages_scanned_last {
            return;
        }

        let prev_strength = self.hash.strength;

        match self.tune.state {
            RshashState::Still => match self.judge_rshash_direction() {
                Direction::Up => {
                    if self.tune.pre_direct == Direction::Down {
                        self.hash.strength_delta = 0;
                    }
                    let delta = self.hash.strength_delta;
                    self.hash.inc_strength(delta);
                    self.hash.inc_strength_delta();
                    self.tune.stable_benefit = self.current_benefit();
                    self.tune.pre_direct = Direction::Up;
                }
                Direction::Down => {
                    if self.tune.pre_direct == Direction::Up {
                        self.hash.strength_delta = 0;
                    }
                    let delta = self.hash.strength_delta;
                    self.hash.dec_strength(delta);
                    self.hash.inc_strength_delta();
                    self.tune.stable_benefit = self.current_benefit();
                    self.tune.pre_direct = Direction::Down;
                }
                Direction::Obscure => {
                    self.tune.stable_point = self.hash.strength;
                    self.tune.turn_point_down = self.hash.strength;
                    self.tune.turn_point_up = self.hash.strength;
                    self.tune.turn_benefit_down = self.current_benefit();
                    self.tune.turn_benefit_up = self.current_benefit();
                    self.tune.lookup_window_index = 0;
                    self.tune.state = RshashState::TryDown;
                    let delta = self.hash.strength_delta;
                    self.hash.dec_strength(delta);
                    self.hash.inc_strength_delta();
                }
                Direction::Still => {}
            },

            RshashState::TryDown => {
                if self.tune.lookup_window_index % 5 == 0 {
                    self.tune.below_count = 0;
                }
                self.tune.lookup_window_index = self.tune.lookup_window_index.wrapping_add(1);

                let benefit = self.current_benefit();
                if benefit < self.tune.stable_benefit {
                    self.tune.below_count += 1;
                } else if benefit > self.tune.turn_benefit_down {
                    self.tune.turn_point_down = self.hash.strength;
                    self.tune.turn_benefit_down = benefit;
                }

                if self.tune.below_count >= 3 || self.judge_rshash_direction() == Direction::Up {
                    // the bottom is behind us; probe upward from the last
                    // stable point
                    self.hash.strength = self.tune.stable_point;
                    self.hash.strength_delta = 0;
                    self.hash.inc_strength(0);
                    self.hash.inc_strength_delta();
                    self.tune.lookup_window_index = 0;
                    self.tune.state = RshashState::TryUp;
                    self.hash.strength_delta = 0;
                } else {
                    let delta = self.hash.strength_delta;
                    self.hash.dec_strength(delta);
                    self.hash.inc_strength_delta();
                }
            }

            RshashState::TryUp => {
                if self.tune.lookup_window_index % 5 == 0 {
                    self.tune.below_count = 0;
                }
                self.tune.lookup_window_index = self.tune.lookup_window_index.wrapping_add(1);

                let benefit = self.current_benefit();
                if benefit < self.tune.stable_benefit {
                    self.tune.below_count += 1;
                } else if benefit > self.tune.turn_benefit_up {
                    self.tune.turn_point_up = self.hash.strength;
                    self.tune.turn_benefit_up = benefit;
                }

                if self.tune.below_count >= 3 || self.judge_rshash_direction() == Direction::Down {
                    self.hash.strength = if self.tune.turn_benefit_up > self.tune.turn_benefit_down
                    {
                        self.tune.turn_point_up
                    } else {
                        self.tune.turn_point_down
                    };
                    self.tune.state = RshashState::PreStill;
                } else {
                    let delta = self.hash.strength_delta;
                    self.hash.inc_strength(delta);
                    self.hash.inc_strength_delta();
                }
            }

            RshashState::New | RshashState::PreStill => {
                self.tune.stable_benefit = self.current_benefit();
                self.tune.state = RshashState::Still;
                self.hash.strength_delta = 0;
            }
        }

        self.hash.pos = 0;
        self.hash.neg = 0;

        if prev_strength != self.hash.strength {
            log::info!(
                "mm/uksm: hash strength {} -> {}",
                prev_strength,
                self.hash.strength
            );
            self.stable_tree_delta_hash(prev_strength);
        }
    }
}
