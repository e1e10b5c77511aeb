//! Commit graph
//!
//! Commits form a DAG: a commit row plus ordered `commit_edge` rows to its
//! parents. Traversal is an explicit breadth-first walk with a visited set,
//! so merge commits (several parents) and shared history are visited once.
//!
//! Edges are only ever added when a commit is created, which makes cycles
//! structurally impossible; [`CommitGraph::link`] still checks reachability
//! before inserting an edge.

use crate::backend::{Backend, int_at, text_at};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::object::Commit;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

pub struct CommitGraph<'a> {
    backend: &'a dyn Backend,
}

impl<'a> CommitGraph<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let result = self
            .backend
            .execute("SELECT 1 FROM \"commit\" WHERE id = ?1", &[id.into()])?;
        Ok(!result.is_empty())
    }

    pub fn get(&self, id: &str) -> Result<Commit> {
        let result = self.backend.execute(
            "SELECT id, change_set_id, created_at FROM \"commit\" WHERE id = ?1",
            &[id.into()],
        )?;
        let row = result
            .first()
            .ok_or_else(|| EngineError::not_found("commit", id))?;
        Ok(Commit {
            id: text_at(row, 0, "id")?,
            change_set_id: text_at(row, 1, "change_set_id")?,
            created_at: text_at(row, 2, "created_at")?,
            parent_ids: self.parents(id)?,
        })
    }

    /// Parent ids in edge order
    pub fn parents(&self, id: &str) -> Result<Vec<String>> {
        let result = self.backend.execute(
            "SELECT parent_id FROM commit_edge WHERE child_id = ?1 ORDER BY position",
            &[id.into()],
        )?;
        result
            .rows
            .iter()
            .map(|row| text_at(row, 0, "parent_id"))
            .collect()
    }

    pub fn children(&self, id: &str) -> Result<Vec<String>> {
        let result = self.backend.execute(
            "SELECT child_id FROM commit_edge WHERE parent_id = ?1 ORDER BY child_id",
            &[id.into()],
        )?;
        result
            .rows
            .iter()
            .map(|row| text_at(row, 0, "child_id"))
            .collect()
    }

    pub fn count(&self) -> Result<i64> {
        let result = self.backend.execute("SELECT COUNT(*) FROM \"commit\"", &[])?;
        match result.first() {
            Some(row) => int_at(row, 0, "count"),
            None => Ok(0),
        }
    }

    /// Create a commit over a change set with the given parents
    pub fn create_commit(
        &self,
        clock: &mut Clock,
        change_set_id: &str,
        parent_ids: &[String],
    ) -> Result<Commit> {
        let known_set = self
            .backend
            .execute("SELECT 1 FROM change_set WHERE id = ?1", &[change_set_id.into()])?;
        if known_set.is_empty() {
            return Err(EngineError::not_found("change set", change_set_id));
        }
        let mut parents: Vec<String> = Vec::with_capacity(parent_ids.len());
        for parent in parent_ids {
            if !self.exists(parent)? {
                return Err(EngineError::not_found("commit", parent.as_str()));
            }
            if !parents.contains(parent) {
                parents.push(parent.clone());
            }
        }

        let commit = Commit {
            id: clock.new_id(),
            change_set_id: change_set_id.to_string(),
            created_at: clock.now(),
            parent_ids: parents,
        };
        self.backend.execute(
            "INSERT INTO \"commit\" (id, change_set_id, created_at) VALUES (?1, ?2, ?3)",
            &[
                commit.id.as_str().into(),
                commit.change_set_id.as_str().into(),
                commit.created_at.as_str().into(),
            ],
        )?;
        for parent in &commit.parent_ids {
            self.link(parent, &commit.id)?;
        }

        debug!(commit_id = %commit.id, parents = commit.parent_ids.len(), "created commit");
        Ok(commit)
    }

    /// Add a parent edge, rejecting edges that would close a cycle
    pub fn link(&self, parent_id: &str, child_id: &str) -> Result<()> {
        for id in [parent_id, child_id] {
            if !self.exists(id)? {
                return Err(EngineError::not_found("commit", id));
            }
        }
        if self.is_ancestor(child_id, parent_id)? {
            return Err(EngineError::CyclicGraph {
                parent_id: parent_id.to_string(),
                child_id: child_id.to_string(),
            });
        }
        let position = self.parents(child_id)?.len() as i64;
        self.backend.execute(
            "INSERT INTO commit_edge (parent_id, child_id, position) VALUES (?1, ?2, ?3) \
             ON CONFLICT (parent_id, child_id) DO NOTHING",
            &[parent_id.into(), child_id.into(), position.into()],
        )?;
        Ok(())
    }

    /// Breadth-first walk from `start` (inclusive) with each commit's depth
    pub fn walk(&self, start: &str) -> Walk<'_> {
        Walk {
            graph: CommitGraph {
                backend: self.backend,
            },
            queue: VecDeque::from([(start.to_string(), 0)]),
            seen: HashSet::new(),
        }
    }

    /// Lazy, deduplicated sequence of the strict ancestors of `id`
    pub fn ancestors(&self, id: &str) -> impl Iterator<Item = Result<String>> + '_ {
        self.walk(id).skip(1).map(|step| step.map(|(commit_id, _)| commit_id))
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own ancestor)
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        for step in self.walk(descendant) {
            if step?.0 == ancestor {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge base of two commits
    ///
    /// Collects the common ancestors nearest to `b` and drops any that is an
    /// ancestor of another. A DAG can have several equally low common
    /// ancestors; the one returned is the first reached breadth-first from `b`.
    pub fn lowest_common_ancestor(&self, a: &str, b: &str) -> Result<Option<String>> {
        for id in [a, b] {
            if !self.exists(id)? {
                return Err(EngineError::not_found("commit", id));
            }
        }

        let from_a: HashSet<String> = self
            .walk(a)
            .map(|step| step.map(|(id, _)| id))
            .collect::<Result<_>>()?;

        let mut candidates: Vec<String> = Vec::new();
        let mut queue = VecDeque::from([b.to_string()]);
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if from_a.contains(&id) {
                candidates.push(id);
                continue;
            }
            queue.extend(self.parents(&id)?);
        }

        for candidate in &candidates {
            let mut dominated = false;
            for other in &candidates {
                if other != candidate && self.is_ancestor(candidate, other)? {
                    dominated = true;
                    break;
                }
            }
            if !dominated {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }
}

/// Iterator returned by [`CommitGraph::walk`]
pub struct Walk<'a> {
    graph: CommitGraph<'a>,
    queue: VecDeque<(String, usize)>,
    seen: HashSet<String>,
}

impl Iterator for Walk<'_> {
    type Item = Result<(String, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((id, depth)) = self.queue.pop_front() {
            if !self.seen.insert(id.clone()) {
                continue;
            }
            match self.graph.parents(&id) {
                Ok(parents) => {
                    self.queue
                        .extend(parents.into_iter().map(|parent| (parent, depth + 1)));
                    return Some(Ok((id, depth)));
                }
                Err(e) => {
                    self.queue.clear();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
