//! Score-chart slave selection
//!
//! Each filter adds to (or subtracts from) the score of every candidate, or
//! removes candidates outright. The highest score wins; equal scores go to
//! the candidate listed first.

use std::sync::Arc;

use crate::config::{FilterConfig, FilterKind};
use crate::error::{VfsError, VfsResult};
use crate::slave::SlaveHandle;
use crate::transfer::Direction;
use crate::vfs::Node;

/// What a selection is for
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub path: String,
    /// Directory the transfer lands in or reads from
    pub dir: Option<Arc<Node>>,
}

impl SelectionContext {
    pub fn for_file(node: &Node) -> Self {
        Self {
            path: node.path(),
            dir: node.parent(),
        }
    }

    pub fn for_path(dir: &Arc<Node>, path: &str) -> Self {
        Self {
            path: path.to_string(),
            dir: Some(dir.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlaveScore {
    pub slave: Arc<SlaveHandle>,
    pub score: i64,
}

#[derive(Debug, Clone)]
pub struct ScoreChart {
    scores: Vec<SlaveScore>,
}

impl ScoreChart {
    pub fn new(slaves: &[Arc<SlaveHandle>]) -> Self {
        Self {
            scores: slaves
                .iter()
                .map(|s| SlaveScore {
                    slave: s.clone(),
                    score: 0,
                })
                .collect(),
        }
    }

    pub fn scores(&self) -> &[SlaveScore] {
        &self.scores
    }

    pub fn scores_mut(&mut self) -> &mut [SlaveScore] {
        &mut self.scores
    }

    pub fn score_of(&self, slave: &SlaveHandle) -> Option<i64> {
        self.scores.iter().find(|s| *s.slave == *slave).map(|s| s.score)
    }

    pub fn add_score(&mut self, slave: &SlaveHandle, delta: i64) {
        if let Some(s) = self.scores.iter_mut().find(|s| *s.slave == *slave) {
            s.score += delta;
        }
    }

    pub fn remove(&mut self, slave: &SlaveHandle) {
        self.scores.retain(|s| *s.slave != *slave);
    }

    /// Highest score among slaves that are still online
    pub fn best(&self) -> Option<&SlaveScore> {
        let mut best: Option<&SlaveScore> = None;
        for s in self.scores.iter().filter(|s| s.slave.is_available()) {
            if best.map_or(true, |b| s.score > b.score) {
                best = Some(s);
            }
        }
        best
    }
}

pub trait Filter: Send + Sync {
    fn process(&self, chart: &mut ScoreChart, direction: Direction, ctx: &SelectionContext, now: i64);
}

/// Penalise slaves that transferred in the same direction less than
/// `mintime_ms` ago, by the time remaining times `multiplier`
pub struct MintimeFilter {
    pub mintime_ms: i64,
    pub multiplier: f64,
}

impl Filter for MintimeFilter {
    fn process(&self, chart: &mut ScoreChart, direction: Direction, _ctx: &SelectionContext, now: i64) {
        for s in chart.scores_mut() {
            let elapsed = now - s.slave.last_transfer(direction);
            if elapsed < self.mintime_ms {
                s.score -= ((self.mintime_ms - elapsed) as f64 * self.multiplier) as i64;
            }
        }
    }
}

/// Penalise by number of running transfers
pub struct LoadFilter {
    pub multiplier: f64,
}

impl Filter for LoadFilter {
    fn process(&self, chart: &mut ScoreChart, _direction: Direction, _ctx: &SelectionContext, _now: i64) {
        for s in chart.scores_mut() {
            s.score -= (s.slave.active_transfers() as f64 * self.multiplier) as i64;
        }
    }
}

/// Reward the slave that has waited longest for a transfer in this
/// direction, which cycles transfers over the pool
pub struct CycleFilter {
    pub assign: i64,
}

impl Filter for CycleFilter {
    fn process(&self, chart: &mut ScoreChart, direction: Direction, _ctx: &SelectionContext, _now: i64) {
        let oldest = chart
            .scores()
            .iter()
            .min_by_key(|s| s.slave.last_transfer(direction))
            .map(|s| s.slave.clone());
        if let Some(slave) = oldest {
            chart.add_score(&slave, self.assign);
        }
    }
}

/// Give `assign` points to the `top` slaves holding the most files in the
/// target directory. With `assign == 0` every other slave is dropped.
pub struct AffinityFilter {
    pub top: usize,
    pub assign: i64,
}

impl Filter for AffinityFilter {
    fn process(&self, chart: &mut ScoreChart, _direction: Direction, ctx: &SelectionContext, _now: i64) {
        let Some(dir) = &ctx.dir else {
            return;
        };
        let mut counts: Vec<(Arc<SlaveHandle>, usize)> = chart
            .scores()
            .iter()
            .map(|s| (s.slave.clone(), dir.files_on(&s.slave)))
            .filter(|(_, n)| *n > 0)
            .collect();
        // stable: equal counts keep chart order
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let top: Vec<Arc<SlaveHandle>> = counts.into_iter().take(self.top).map(|(s, _)| s).collect();

        if self.assign == 0 {
            if top.is_empty() {
                return;
            }
            let others: Vec<Arc<SlaveHandle>> = chart
                .scores()
                .iter()
                .filter(|s| !top.contains(&s.slave))
                .map(|s| s.slave.clone())
                .collect();
            for s in others {
                chart.remove(&s);
            }
        } else {
            for s in &top {
                chart.add_score(s, self.assign);
            }
        }
    }
}

pub struct SlaveSelector {
    filters: Vec<Box<dyn Filter>>,
}

impl Default for SlaveSelector {
    fn default() -> Self {
        Self::from_config(&crate::config::Config::default().slave_selection)
    }
}

impl SlaveSelector {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn from_config(cfg: &[FilterConfig]) -> Self {
        let filters = cfg
            .iter()
            .map(|f| -> Box<dyn Filter> {
                match f.kind {
                    FilterKind::Mintime => Box::new(MintimeFilter {
                        mintime_ms: f.mintime_ms,
                        multiplier: f.multiplier,
                    }),
                    FilterKind::Load => Box::new(LoadFilter {
                        multiplier: f.multiplier,
                    }),
                    FilterKind::Cycle => Box::new(CycleFilter { assign: f.assign }),
                    FilterKind::Affinity => Box::new(AffinityFilter {
                        top: f.top,
                        assign: f.assign,
                    }),
                }
            })
            .collect();
        Self { filters }
    }

    /// Pick one online slave out of `candidates`
    pub fn select(
        &self,
        candidates: &[Arc<SlaveHandle>],
        direction: Direction,
        ctx: &SelectionContext,
    ) -> VfsResult<Arc<SlaveHandle>> {
        self.select_at(candidates, direction, ctx, chrono::Utc::now().timestamp_millis())
    }

    pub fn select_at(
        &self,
        candidates: &[Arc<SlaveHandle>],
        direction: Direction,
        ctx: &SelectionContext,
        now: i64,
    ) -> VfsResult<Arc<SlaveHandle>> {
        let online: Vec<Arc<SlaveHandle>> = candidates
            .iter()
            .filter(|s| s.is_available())
            .cloned()
            .collect();
        let mut chart = ScoreChart::new(&online);
        for f in &self.filters {
            f.process(&mut chart, direction, ctx, now);
        }
        chart
            .best()
            .map(|s| s.slave.clone())
            .ok_or_else(|| VfsError::NoAvailableSlave(ctx.path.clone()))
    }
}
