//! Local stream id allocation and the `go_away` latch (§3, §4.4).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::{Error, Result};
use parking_lot::Mutex;

/// Allocates local stream ids and tracks whether the id space is exhausted.
///
/// `next_sid` and `go_away` are guarded by the same lock (§5: "`next_sid` and
/// `go_away`: mutex-guarded together").
#[derive(Debug)]
pub struct StreamIdAllocator {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    next_sid: u32,
    go_away: bool,
}

impl StreamIdAllocator {
    /// Clients start at 1, servers start at 0; both advance by 2 per `Open`.
    #[must_use]
    pub fn new(is_client: bool) -> Self {
        Self {
            state: Mutex::new(State {
                next_sid: if is_client { 1 } else { 0 },
                go_away: false,
            }),
        }
    }

    /// Allocate the next local stream id, or fail with [`Error::GoAway`] if
    /// the id space was already exhausted or this allocation would wrap.
    ///
    /// The wraparound check compares the post-increment value to the
    /// pre-increment value: a wrap manifests as `post < pre`. This is the
    /// corrected intent behind the legacy `sid == sid % 2` check, which does
    /// not actually detect wraparound (see `SPEC_FULL.md` §9).
    pub fn allocate(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.go_away {
            return Err(Error::GoAway);
        }
        let pre = state.next_sid;
        let post = pre.wrapping_add(2);
        if post < pre {
            state.go_away = true;
            return Err(Error::GoAway);
        }
        state.next_sid = post;
        Ok(pre)
    }

    /// Whether the id space has been latched as exhausted.
    #[must_use]
    pub fn is_go_away(&self) -> bool {
        self.state.lock().go_away
    }

    /// Latch `go_away` unconditionally, e.g. when the Session is closing.
    pub fn latch_go_away(&self) {
        self.state.lock().go_away = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_odd_and_increase_by_two() {
        let alloc = StreamIdAllocator::new(true);
        assert_eq!(alloc.allocate().unwrap(), 1);
        assert_eq!(alloc.allocate().unwrap(), 3);
        assert_eq!(alloc.allocate().unwrap(), 5);
    }

    #[test]
    fn server_ids_are_even_and_increase_by_two() {
        let alloc = StreamIdAllocator::new(false);
        assert_eq!(alloc.allocate().unwrap(), 0);
        assert_eq!(alloc.allocate().unwrap(), 2);
        assert_eq!(alloc.allocate().unwrap(), 4);
    }

    #[test]
    fn wraparound_latches_go_away() {
        let alloc = StreamIdAllocator {
            state: Mutex::new(State {
                next_sid: u32::MAX - 1,
                go_away: false,
            }),
        };
        // u32::MAX - 1 + 2 wraps to 0, which is < pre: GoAway.
        assert!(matches!(alloc.allocate(), Err(Error::GoAway)));
        assert!(alloc.is_go_away());
        assert!(matches!(alloc.allocate(), Err(Error::GoAway)));
    }
}
