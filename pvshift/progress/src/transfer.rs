//! Byte counters for data streamed through the CLI.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::ProgressTracker;

const SIZED_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const UNSIZED_TEMPLATE: &str = "{spinner} {msg} [{elapsed_precise}] {bytes} ({bytes_per_sec})";

/// Live byte count of one transfer.
///
/// Only drawn next to a [`crate::SpinnerProgress`], other modes get a hidden bar that still counts.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(tracker: &ProgressTracker, label: &str, total: Option<u64>) -> Self {
        let bar = match tracker {
            ProgressTracker::SpinnerProgress(spinner) => {
                let bar = match total {
                    Some(total) => ProgressBar::new(total),
                    None => ProgressBar::new_spinner(),
                };
                spinner.attach(bar)
            }
            _ => ProgressBar::hidden(),
        };

        let template = if total.is_some() {
            SIZED_TEMPLATE
        } else {
            UNSIZED_TEMPLATE
        };
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style);
        }
        if let Some(total) = total {
            bar.set_length(total);
        }
        bar.set_message(label.to_owned());

        TransferProgress { bar }
    }

    /// Bytes counted so far.
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }

    /// Counts every byte written to `inner`.
    pub fn writer<W>(&self, inner: W) -> ProgressWriter<W> {
        ProgressWriter {
            inner,
            bar: self.bar.clone(),
        }
    }

    /// Counts every byte read from `inner`.
    pub fn reader<R>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            bar: self.bar.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ProgressWriter<W> {
    inner: W,
    bar: ProgressBar,
}

impl<W> ProgressWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> AsyncWrite for ProgressWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = Pin::new(&mut this.inner).poll_write(cx, buf);

        if let Poll::Ready(Ok(amount)) = written {
            this.bar.inc(amount as u64);
        }

        written
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R> AsyncRead for ProgressReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let read = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = read {
            this.bar.inc((buf.filled().len() - before) as u64);
        }

        read
    }
}
