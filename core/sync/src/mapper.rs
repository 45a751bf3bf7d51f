//! One-directional translation from the origin object into the target.

use async_trait::async_trait;
use tracing::debug;

use mirrorsync_common::{Access, FieldKey, FieldValue, Side};

use crate::entity::Entity;
use crate::object::SyncableObject;
use crate::pair::Pair;
use crate::result::MapStatus;

/// Outcome of a mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct MapResult {
    pub status: MapStatus,
    pub message: Option<String>,
}

impl MapResult {
    pub fn success() -> Self {
        Self {
            status: MapStatus::Success,
            message: None,
        }
    }

    pub fn skipped_all(message: impl Into<String>) -> Self {
        Self {
            status: MapStatus::SkippedAllChanges,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: MapStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// Writes origin values into the target's tracked fields.
///
/// A mapper creates the target object if the pair has none, sets only the
/// fields it changes and never persists anything.
#[async_trait]
pub trait Mapper<E: Entity>: Send + Sync {
    async fn map_one_way(&self, pair: &mut Pair<E>) -> MapResult;

    /// Whether objects on `side` accept updates. Creates are always tried.
    fn update_capable(&self, _side: Side) -> bool {
        true
    }
}

/// Which sync directions a column takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Both,
    /// Only when the local side is the origin.
    ToRemote,
    /// Only when the remote side is the origin.
    ToLocal,
}

impl Direction {
    fn allows(self, origin: Side) -> bool {
        match self {
            Direction::Both => true,
            Direction::ToRemote => origin == Side::Local,
            Direction::ToLocal => origin == Side::Remote,
        }
    }
}

struct Column<E: Entity> {
    local: E::Local,
    remote: E::Remote,
    direction: Direction,
    required: bool,
}

/// Predicate deciding that an origin object should not be mapped at all.
pub type SkipPredicate<F> = Box<dyn Fn(&SyncableObject<F>) -> Option<String> + Send + Sync>;

/// Column-table mapper: each column copies one local field to one remote
/// field, or back.
pub struct TableMapper<E: Entity> {
    columns: Vec<Column<E>>,
    skip_local: Option<SkipPredicate<E::Local>>,
    skip_remote: Option<SkipPredicate<E::Remote>>,
    no_updates: Vec<Side>,
}

impl<E: Entity> Default for TableMapper<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> TableMapper<E> {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            skip_local: None,
            skip_remote: None,
            no_updates: Vec::new(),
        }
    }

    /// Map in both directions.
    pub fn column(self, local: E::Local, remote: E::Remote) -> Self {
        self.push(local, remote, Direction::Both, false)
    }

    /// Map in both directions; an empty origin value fails the mapping.
    pub fn required(self, local: E::Local, remote: E::Remote) -> Self {
        self.push(local, remote, Direction::Both, true)
    }

    pub fn one_way(self, local: E::Local, remote: E::Remote, direction: Direction) -> Self {
        self.push(local, remote, direction, false)
    }

    fn push(mut self, local: E::Local, remote: E::Remote, direction: Direction, required: bool) -> Self {
        self.columns.push(Column {
            local,
            remote,
            direction,
            required,
        });
        self
    }

    /// Skip local origins for which `predicate` returns a reason.
    pub fn skip_local_when(mut self, predicate: SkipPredicate<E::Local>) -> Self {
        self.skip_local = Some(predicate);
        self
    }

    /// Skip remote origins for which `predicate` returns a reason.
    pub fn skip_remote_when(mut self, predicate: SkipPredicate<E::Remote>) -> Self {
        self.skip_remote = Some(predicate);
        self
    }

    /// Objects on `side` are never updated (immutable on that store).
    pub fn no_updates_on(mut self, side: Side) -> Self {
        self.no_updates.push(side);
        self
    }

    /// Copy origin values into the target, touching only changed fields.
    fn apply<S: FieldKey, T: FieldKey>(
        origin: &SyncableObject<S>,
        target: &mut SyncableObject<T>,
        columns: impl Iterator<Item = (S, T, bool)>,
    ) -> MapResult {
        let mut staged: Vec<(T, FieldValue)> = Vec::new();
        for (from, to, required) in columns {
            let value = origin.get(from);
            if required && value.is_empty() {
                return MapResult::error(format!("{} is required", from.name()));
            }
            staged.push((to, value.clone()));
        }

        for (key, value) in staged {
            match key.access() {
                Access::ReadOnly => continue,
                Access::CreateOnly if target.has_id() => continue,
                _ => {}
            }
            if target.get(key).equivalent(&value) {
                continue;
            }
            if let Err(e) = target.set(key, value) {
                return MapResult::error(e.to_string());
            }
        }
        MapResult::success()
    }
}

#[async_trait]
impl<E: Entity> Mapper<E> for TableMapper<E> {
    async fn map_one_way(&self, pair: &mut Pair<E>) -> MapResult {
        let origin = pair.origin();
        let active = self.columns.iter().filter(|c| c.direction.allows(origin));

        match origin {
            Side::Local => {
                let Some(source) = pair.local.take() else {
                    return MapResult::error("pair has no local object");
                };
                let result = match self.skip_local.as_ref().and_then(|skip| skip(&source)) {
                    Some(reason) => MapResult::skipped_all(reason),
                    None => Self::apply(
                        &source,
                        pair.ensure_remote(),
                        active.map(|c| (c.local, c.remote, c.required)),
                    ),
                };
                pair.local = Some(source);
                debug!("Mapped {} local -> remote: {:?}", E::TYPE, result.status);
                result
            }
            Side::Remote => {
                let Some(source) = pair.remote.take() else {
                    return MapResult::error("pair has no remote object");
                };
                let result = match self.skip_remote.as_ref().and_then(|skip| skip(&source)) {
                    Some(reason) => MapResult::skipped_all(reason),
                    None => Self::apply(
                        &source,
                        pair.ensure_local(),
                        active.map(|c| (c.remote, c.local, c.required)),
                    ),
                };
                pair.remote = Some(source);
                debug!("Mapped {} remote -> local: {:?}", E::TYPE, result.status);
                result
            }
        }
    }

    fn update_capable(&self, side: Side) -> bool {
        !self.no_updates.contains(&side)
    }
}
