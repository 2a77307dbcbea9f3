/* Device discovery: watches the device directory for created entries and performs the
 * initial recursive scan. Removal is deliberately not watched here; the service learns
 * about unplugs from its own reads coming back "device not ready".
 *
 * The inotify handle is polled from a blocking thread with a one-second timeout so the
 * monitor can notice a stop request without any event arriving. */
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::server::ServiceMessage;

/* Lets the owner stop the monitor thread. */
#[derive(Clone)]
pub struct MonitorControl {
    running: Arc<AtomicBool>,
}

impl MonitorControl {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/* Spawn the monitor onto the runtime and hand back its stop control. */
pub fn start(queue: UnboundedSender<ServiceMessage>, device_dir: PathBuf) -> MonitorControl {
    let control = MonitorControl {
        running: Arc::new(AtomicBool::new(true)),
    };
    tokio::spawn(run(queue, device_dir, control.clone()));
    control
}

/* Run the path monitor: subscribe, scan existing entries, then watch for new ones.
 *
 * Inotify reads and the recursive scan are synchronous, so everything runs inside a
 * blocking thread. */
pub async fn run(queue: UnboundedSender<ServiceMessage>, device_dir: PathBuf, control: MonitorControl) {
    info!("Path monitor started on {:?}", device_dir);

    let result = tokio::task::spawn_blocking(move || {
        run_blocking(queue, &device_dir, &control.running)
    })
    .await;

    match result {
        Ok(Ok(())) => info!("Path monitor shutting down normally"),
        Ok(Err(err)) => warn!("Path monitor error: {}", err),
        Err(err) => warn!("Path monitor task panicked: {}", err),
    }
}

/* Synchronous monitor implementation. */
fn run_blocking(
    queue: UnboundedSender<ServiceMessage>,
    device_dir: &Path,
    running: &AtomicBool,
) -> Result<(), String> {
    let inotify =
        Inotify::init(InitFlags::IN_NONBLOCK).map_err(|e| format!("inotify init: {}", e))?;

    /* Watch descriptors to directory paths; a handful of entries at most, so a plain
     * list beats a map. */
    let mut watches: Vec<(WatchDescriptor, PathBuf)> = Vec::new();

    /* Subscribe before scanning so an entry appearing mid-scan is either scanned or
     * reported; the add is idempotent either way. */
    watch_tree(&inotify, &mut watches, device_dir, &queue)?;

    loop {
        if !running.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut pollfd = [nix::poll::PollFd::new(
            inotify.as_fd(),
            nix::poll::PollFlags::POLLIN,
        )];

        /* Block until the fd is readable (or timeout after 1 second to allow shutdown) */
        match nix::poll::poll(&mut pollfd, nix::poll::PollTimeout::from(1000u16)) {
            Ok(0) => continue, /* timeout, loop and re-check */
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(format!("poll: {}", e)),
        }

        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => continue,
            Err(e) => return Err(format!("read_events: {}", e)),
        };

        for event in events {
            if !event.mask.contains(AddWatchFlags::IN_CREATE) {
                continue;
            }
            let Some(name) = event.name else { continue };
            let Some(parent) = watches
                .iter()
                .find(|(wd, _)| *wd == event.wd)
                .map(|(_, path)| path.clone())
            else {
                continue;
            };
            let path = parent.join(name);

            if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                /* A new subtree: watch it and pick up anything already inside. */
                if let Err(err) = watch_tree(&inotify, &mut watches, &path, &queue) {
                    warn!("Failed to watch {:?}: {}", path, err);
                }
            } else {
                info!("Entry created: {:?}", path);
                if queue.send(ServiceMessage::DeviceAppeared { path }).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/* Add a watch on `dir`, then scan it: files are announced, subdirectories recurse. */
fn watch_tree(
    inotify: &Inotify,
    watches: &mut Vec<(WatchDescriptor, PathBuf)>,
    dir: &Path,
    queue: &UnboundedSender<ServiceMessage>,
) -> Result<(), String> {
    let wd = inotify
        .add_watch(dir, AddWatchFlags::IN_CREATE)
        .map_err(|e| format!("add_watch {:?}: {}", dir, e))?;
    watches.push((wd, dir.to_path_buf()));
    debug!("Watching {:?}", dir);

    let entries = std::fs::read_dir(dir).map_err(|e| format!("read_dir {:?}: {}", dir, e))?;
    let mut entries: Vec<_> = entries.flatten().collect();
    /* Directory order is filesystem whim; keep ids stable across restarts. */
    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => watch_tree(inotify, watches, &path, queue)?,
            Ok(kind) if kind.is_file() || kind.is_char_device() => {
                debug!("Scanned existing entry: {:?}", path);
                let _ = queue.send(ServiceMessage::DeviceAppeared { path });
            }
            _ => {}
        }
    }

    Ok(())
}
