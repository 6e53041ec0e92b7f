//! Queue router: priority → lane, and dispatch tokens for the current attempt.

use tasklane_core::{DispatchToken, Lane, Task};

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueRouter;

impl QueueRouter {
    pub fn route(&self, task: &Task) -> Lane {
        Lane::for_priority(task.priority)
    }

    /// Token for the attempt recorded on `task`.
    pub fn token(&self, task: &Task) -> DispatchToken {
        DispatchToken::new(task.id.clone(), task.attempt, self.route(task))
    }
}
