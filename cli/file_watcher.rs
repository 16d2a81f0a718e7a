// Copyright 2024-2026 the Bungae authors. MIT license.

use core::task::Context;
use core::task::Poll;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use futures::stream::Stream;
use notify::event::Event as NotifyEvent;
use notify::event::EventKind;
use notify::Config;
use notify::Error as NotifyError;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;

use crate::errors::AnyError;

const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(200);
const DEBOUNCE_POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// Collects raw watcher events into debounced batches of changed paths, so
/// one save (or one git checkout) becomes one rebuild. Never yields
/// `None`; the watcher lives until the process exits.
pub struct Debounce {
  rx: Receiver<Result<NotifyEvent, NotifyError>>,
  debounce_time: Duration,
  start_time: Option<Instant>,
  changed_paths: HashSet<PathBuf>,
}

impl Debounce {
  fn new(
    rx: Receiver<Result<NotifyEvent, NotifyError>>,
    debounce_time: Duration,
  ) -> Self {
    Self {
      rx,
      debounce_time,
      start_time: None,
      changed_paths: HashSet::new(),
    }
  }
}

impl Stream for Debounce {
  type Item = Vec<PathBuf>;

  fn poll_next(
    self: Pin<&mut Self>,
    cx: &mut Context,
  ) -> Poll<Option<Self::Item>> {
    let inner = self.get_mut();
    while let Ok(Ok(event)) = inner.rx.try_recv() {
      if matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
      ) {
        inner.start_time = Some(Instant::now());
        inner.changed_paths.extend(event.paths);
      }
    }

    let elapsed = inner
      .start_time
      .map_or(false, |start_time| start_time.elapsed() >= inner.debounce_time);
    if !inner.changed_paths.is_empty() && elapsed {
      inner.start_time = None;
      let mut paths: Vec<PathBuf> =
        inner.changed_paths.drain().collect();
      paths.sort();
      return Poll::Ready(Some(paths));
    }

    // To avoid a hot loop, defer signaling the waker for the next polling.
    let waker = cx.waker().clone();
    thread::spawn(move || {
      thread::sleep(DEBOUNCE_POLLING_INTERVAL);
      waker.wake();
    });
    Poll::Pending
  }
}

/// Starts a recursive watcher over `paths`. The returned watcher must stay
/// alive as long as the stream is polled.
pub fn watch(
  paths: &[PathBuf],
) -> Result<(RecommendedWatcher, Debounce), AnyError> {
  let (sender, receiver) = mpsc::channel::<Result<NotifyEvent, NotifyError>>();

  let mut watcher = RecommendedWatcher::new(
    move |res: Result<NotifyEvent, NotifyError>| {
      // If send fails the watcher is shutting down; remaining events are
      // of no interest.
      let _ = sender.send(res);
    },
    Config::default(),
  )?;

  for path in paths {
    watcher.watch(path, RecursiveMode::Recursive)?;
  }

  Ok((watcher, Debounce::new(receiver, DEBOUNCE_TIMEOUT)))
}

/// True when a changed path is plausibly build input; dotfiles and the
/// cache directory are not.
pub fn is_relevant(path: &Path, cache_dir: &Path) -> bool {
  if path.starts_with(cache_dir) {
    return false;
  }
  !path.components().any(|c| {
    matches!(
      c,
      std::path::Component::Normal(name)
        if name.to_string_lossy().starts_with('.')
    )
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use std::fs;
  use tempfile::TempDir;

  #[tokio::test]
  async fn test_watch_batches_changes() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    fs::write(root.join("a.js"), "1").unwrap();

    let (_watcher, mut debounce) = watch(&[root.clone()]).unwrap();
    // Give the watcher backend a moment to register before mutating.
    tokio::time::sleep(Duration::from_millis(100)).await;
    fs::write(root.join("a.js"), "2").unwrap();
    fs::write(root.join("b.js"), "3").unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(10), debounce.next())
      .await
      .expect("watcher timed out")
      .expect("stream ended");
    assert!(batch.iter().any(|p| p.ends_with("a.js") || p.ends_with("b.js")));
  }

  #[test]
  fn test_is_relevant() {
    let cache = PathBuf::from("/proj/.bungae/cache");
    assert!(is_relevant(Path::new("/proj/src/app.js"), &cache));
    assert!(!is_relevant(Path::new("/proj/.bungae/cache/x.json"), &cache));
    assert!(!is_relevant(Path::new("/proj/.git/index"), &cache));
  }
}
