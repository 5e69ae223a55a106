// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The queue of submitted jobs awaiting an upstream handle: a FIFO in
//! two segments, pending GETs ahead of pending POSTs. GETs gate a
//! waiting compile, POSTs are background uploads, so GETs always jump
//! the queue.

use std::{collections::VecDeque, os::unix::io::RawFd};

/// Jobs are identified by the session's socket descriptor, which is
/// the session table key.
#[derive(Default)]
pub struct JobQueue {
    gets: VecDeque<RawFd>,
    posts: VecDeque<RawFd>,
}

impl JobQueue {
    pub fn new() -> JobQueue {
        JobQueue::default()
    }

    pub fn push(&mut self, session: RawFd, is_post: bool) {
        if is_post {
            self.posts.push_back(session);
        } else {
            self.gets.push_back(session);
        }
    }

    /// Pop the highest-priority pending job: GETs in arrival order,
    /// then POSTs in arrival order.
    pub fn pop(&mut self) -> Option<RawFd> {
        self.gets.pop_front().or_else(|| self.posts.pop_front())
    }

    /// Drop a queued job whose client went away.
    pub fn remove(&mut self, session: RawFd) {
        self.gets.retain(|fd| *fd != session);
        self.posts.retain(|fd| *fd != session);
    }

    pub fn len(&self) -> usize {
        self.gets.len() + self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gets.is_empty() && self.posts.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gets_preempt_posts() {
        // an arbitrary interleaving of gets (even fds) and posts (odd)
        let mut queue = JobQueue::new();
        let arrivals: Vec<(RawFd, bool)> =
            vec![(1, true), (2, false), (3, true), (4, false), (5, true), (6, false)];
        for (fd, is_post) in arrivals {
            queue.push(fd, is_post);
        }

        let mut order = vec![];
        while let Some(fd) = queue.pop() {
            order.push(fd);
        }
        assert_eq!(order, vec![2, 4, 6, 1, 3, 5]);
    }

    #[test]
    fn interleaved_push_pop() {
        let mut queue = JobQueue::new();
        queue.push(10, true);
        queue.push(11, false);
        assert_eq!(queue.pop(), Some(11));
        queue.push(12, false);
        queue.push(13, true);
        assert_eq!(queue.pop(), Some(12));
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), Some(13));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_dead_client() {
        let mut queue = JobQueue::new();
        queue.push(1, false);
        queue.push(2, false);
        queue.push(3, true);
        queue.remove(2);
        queue.remove(3);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }
}
