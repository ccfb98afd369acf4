//! Lazy iteration over the audit trail.
//!
//! Pages are fetched on demand with keyset pagination, so the sequence is
//! finite and restarting simply means calling [`entries`] again (or resuming
//! from a saved [`AuditCursor`] with [`entries_after`]).

use std::collections::VecDeque;

use futures::stream::{self, Stream};

use super::repo_types::{AuditCursor, AuditFilter, AuditLogEntry, Pagination};
use super::AuditLog;
use crate::error::{Error, Result};

struct Walk {
    filter: AuditFilter,
    next: Option<AuditCursor>,
    buffered: VecDeque<AuditLogEntry>,
    exhausted: bool,
    page_size: u32,
}

/// Every entry matching `filter`, most recent first.
pub fn entries<'a, L>(
    log: &'a L,
    filter: AuditFilter,
    page_size: u32,
) -> impl Stream<Item = Result<AuditLogEntry>> + 'a
where
    L: AuditLog + ?Sized,
{
    entries_after(log, filter, None, page_size)
}

/// Like [`entries`], resuming strictly after `cursor`.
pub fn entries_after<'a, L>(
    log: &'a L,
    filter: AuditFilter,
    cursor: Option<AuditCursor>,
    page_size: u32,
) -> impl Stream<Item = Result<AuditLogEntry>> + 'a
where
    L: AuditLog + ?Sized,
{
    let walk = Walk {
        filter,
        next: cursor,
        buffered: VecDeque::new(),
        exhausted: false,
        page_size,
    };

    stream::try_unfold(walk, move |mut walk| async move {
        loop {
            if let Some(entry) = walk.buffered.pop_front() {
                return Ok::<_, Error>(Some((entry, walk)));
            }
            if walk.exhausted {
                return Ok(None);
            }
            let page = log
                .query(
                    &walk.filter,
                    &Pagination {
                        after: walk.next,
                        limit: walk.page_size,
                    },
                )
                .await?;
            walk.exhausted = page.next.is_none();
            walk.next = page.next;
            walk.buffered.extend(page.entries);
        }
    })
}
