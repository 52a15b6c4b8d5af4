use std::time::Duration;

use crate::{
    event::CancelEvent,
    handle::StreamHandle,
    status::{OperationKind, StreamError},
};

const SELECT: OperationKind = OperationKind {
    code: "spark.transport.select.failed",
    message: "stream select",
};

/// select 的返回原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectOutcome {
    /// 第 `n` 个流（按传入顺序）有事件。
    Stream(usize),
    /// 取消事件已触发，需调用 [`CancelEvent::reset`] 清除。
    CustomEvent,
    Timeout,
    /// 被信号打断或事件无法归属，调用方照常 flush 后重新等待即可。
    Unknown,
}

/// 等待任一流可读、可写（仅当该流关心可写时）或取消事件触发。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 收集每个句柄的 [`crate::SelectSource`]，不可 select 的句柄跳过但保留其序号；
/// - 所有流都关注可读，只有 `want_write` 为真的流额外关注可写，
///   否则空闲连接会令 select 持续返回；
/// - 取消事件优先于流事件报告。
///
/// ## 契约 (What)
/// - `timeout` 为 `None` 时无限等待；
/// - 没有任何可 select 的流时返回 `NotSupported`；
/// - 无论返回何种原因，调用方都应随后对各流调用 `flush`。
pub fn select(
    streams: &[&StreamHandle],
    event: Option<&CancelEvent>,
    timeout: Option<Duration>,
) -> Result<SelectOutcome, StreamError> {
    imp::select(streams, event, timeout)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::status::map_io_error;
    use nix::{
        errno::Errno,
        poll::{PollFd, PollFlags, PollTimeout, poll},
    };
    use std::io;
    use tracing::trace;

    pub(super) fn select(
        streams: &[&StreamHandle],
        event: Option<&CancelEvent>,
        timeout: Option<Duration>,
    ) -> Result<SelectOutcome, StreamError> {
        let mut fds = Vec::with_capacity(streams.len() + 1);
        let mut owners = Vec::with_capacity(streams.len());
        for (index, handle) in streams.iter().enumerate() {
            if let Some(source) = handle.select_source() {
                let mut interest = PollFlags::POLLIN;
                if source.want_write {
                    interest |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(source.fd, interest));
                owners.push(index);
            }
        }
        if fds.is_empty() {
            return Err(StreamError::not_supported(SELECT));
        }
        let event_slot = event.map(|event| {
            fds.push(PollFd::new(event.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });

        let ready = match poll(&mut fds, poll_timeout(timeout)) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => return Ok(SelectOutcome::Unknown),
            Err(errno) => return Err(map_io_error(SELECT, io::Error::from(errno))),
        };
        if ready == 0 {
            return Ok(SelectOutcome::Timeout);
        }
        if let Some(slot) = event_slot {
            if fired(&fds[slot]) {
                return Ok(SelectOutcome::CustomEvent);
            }
        }
        for (slot, owner) in owners.iter().enumerate() {
            if fired(&fds[slot]) {
                trace!(stream = owner, "select woke on stream");
                return Ok(SelectOutcome::Stream(*owner));
            }
        }
        Ok(SelectOutcome::Unknown)
    }

    fn fired(fd: &PollFd<'_>) -> bool {
        fd.revents().is_some_and(|events| !events.is_empty())
    }

    fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
        match timeout {
            None => PollTimeout::NONE,
            Some(duration) => {
                // 向上取整到毫秒，避免亚毫秒超时退化为忙等。
                let millis = duration.as_micros().div_ceil(1000).min(i32::MAX as u128);
                i32::try_from(millis)
                    .ok()
                    .and_then(|millis| PollTimeout::try_from(millis).ok())
                    .unwrap_or(PollTimeout::MAX)
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub(super) fn select(
        _streams: &[&StreamHandle],
        _event: Option<&CancelEvent>,
        _timeout: Option<Duration>,
    ) -> Result<SelectOutcome, StreamError> {
        Err(StreamError::not_supported(SELECT))
    }
}
