use crate::driver::fired::FiredList;
use crate::event::SimpleEvent;
use ahash::AHashMap;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use slab::Slab;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

const EVENTS_CAPACITY: usize = 1024;

// Token space: file descriptors map to their own value, waker registrations
// sit above WAKER_BASE, and the signal pipe claims the top token.
const WAKER_BASE: usize = 1 << 31;
const SIGNAL_TOKEN: Token = Token(usize::MAX);

const NSIG: usize = 64;
const PENDING_INIT: AtomicBool = AtomicBool::new(false);
static SIG_PENDING: [AtomicBool; NSIG] = [PENDING_INIT; NSIG];
static SIG_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signum: libc::c_int) {
    if let Ok(index) = usize::try_from(signum) {
        if index < NSIG {
            SIG_PENDING[index].store(true, Ordering::Relaxed);
        }
    }
    let fd = SIG_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            let _ = libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Thread-safe handle that wakes the backend poll and fires its event.
///
/// The only piece of the driver that may be touched from another thread.
pub struct Notifier {
    waker: mio::Waker,
}

impl Notifier {
    pub fn notify(&self) -> io::Result<()> {
        let r = self.waker.wake();
        eprintln!("DEBUG notify result={:?}", r);
        r
    }
}

#[derive(Default)]
struct FdEntry {
    read: Vec<Rc<SimpleEvent>>,
    write: Vec<Rc<SimpleEvent>>,
    registered: Option<Interest>,
}

impl FdEntry {
    fn wanted_interest(&mut self) -> Option<Interest> {
        self.read.retain(|event| !event.empty());
        self.write.retain(|event| !event.empty());
        let mut want = None;
        if !self.read.is_empty() {
            want = Some(Interest::READABLE);
        }
        if !self.write.is_empty() {
            want = Some(want.map_or(Interest::WRITABLE, |i: Interest| i | Interest::WRITABLE));
        }
        want
    }
}

/// mio-backed readiness source: file descriptors, cross-thread wakers, and
/// POSIX signals routed through a self-pipe.
///
/// Registrations whose events went empty elsewhere are pruned before each
/// poll, the fd-table counterpart of the timer heap's lazy cull.
pub(crate) struct IoBackend {
    poll: mio::Poll,
    events: mio::Events,
    fds: AHashMap<RawFd, FdEntry>,
    wakers: Slab<Rc<SimpleEvent>>,
    signals: AHashMap<libc::c_int, Vec<Rc<SimpleEvent>>>,
    sig_pipe_read: Option<RawFd>,
}

impl IoBackend {
    pub(crate) fn new() -> Self {
        Self {
            poll: mio::Poll::new().expect("failed to create mio poll"),
            events: mio::Events::with_capacity(EVENTS_CAPACITY),
            fds: AHashMap::new(),
            wakers: Slab::new(),
            signals: AHashMap::new(),
            sig_pipe_read: None,
        }
    }

    pub(crate) fn fd_readable(&mut self, fd: RawFd, event: Rc<SimpleEvent>) {
        self.fds.entry(fd).or_default().read.push(event);
    }

    pub(crate) fn fd_writable(&mut self, fd: RawFd, event: Rc<SimpleEvent>) {
        self.fds.entry(fd).or_default().write.push(event);
    }

    /// Fire every registration for `fd` and forget the descriptor.
    pub(crate) fn kill_fd(&mut self, fd: RawFd, fired: &mut FiredList) {
        if let Some(mut entry) = self.fds.remove(&fd) {
            if entry.registered.is_some() {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            for event in entry.read.drain(..) {
                fired.push(event);
            }
            for event in entry.write.drain(..) {
                fired.push(event);
            }
        }
    }

    pub(crate) fn notifier(&mut self, event: Rc<SimpleEvent>) -> io::Result<Notifier> {
        let key = self.wakers.insert(event);
        let waker = mio::Waker::new(self.poll.registry(), Token(WAKER_BASE + key))?;
        Ok(Notifier { waker })
    }

    pub(crate) fn signal(&mut self, signum: libc::c_int, event: Rc<SimpleEvent>) -> io::Result<()> {
        self.ensure_signal_pipe()?;
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        self.signals.entry(signum).or_default().push(event);
        Ok(())
    }

    fn ensure_signal_pipe(&mut self) -> io::Result<()> {
        if self.sig_pipe_read.is_some() {
            return Ok(());
        }
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&fds[0]), SIGNAL_TOKEN, Interest::READABLE)?;
        SIG_PIPE_WRITE.store(fds[1], Ordering::Relaxed);
        self.sig_pipe_read = Some(fds[0]);
        Ok(())
    }

    /// True while anything registered here could still fire.
    pub(crate) fn has_interest(&self) -> bool {
        self.fds.values().any(|entry| {
            entry
                .read
                .iter()
                .chain(entry.write.iter())
                .any(|event| !event.empty())
        }) || self.wakers.iter().any(|(_, event)| !event.empty())
            || self
                .signals
                .values()
                .any(|events| events.iter().any(|event| !event.empty()))
    }

    /// Block for readiness up to `timeout`, collecting the events of every
    /// ready registration into `fired`.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        fired: &mut FiredList,
    ) -> io::Result<()> {
        self.update_registrations()?;
        eprintln!("DEBUG poll: timeout={:?} wakers={}", timeout, self.wakers.len());
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
        eprintln!("DEBUG poll returned, n_events={}", self.events.iter().count());
        let mut signal_ready = false;
        for event in self.events.iter() {
            let token = event.token();
            if token == SIGNAL_TOKEN {
                signal_ready = true;
            } else if token.0 >= WAKER_BASE {
                if let Some(woken) = self.wakers.try_remove(token.0 - WAKER_BASE) {
                    fired.push(woken);
                }
            } else if let Some(entry) = self.fds.get_mut(&(token.0 as RawFd)) {
                if event.is_readable() || event.is_read_closed() {
                    for ready in entry.read.drain(..) {
                        fired.push(ready);
                    }
                }
                if event.is_writable() || event.is_write_closed() {
                    for ready in entry.write.drain(..) {
                        fired.push(ready);
                    }
                }
            }
        }
        if signal_ready {
            self.dispatch_signals(fired);
        }
        Ok(())
    }

    fn update_registrations(&mut self) -> io::Result<()> {
        self.wakers.retain(|_, event| !event.empty());
        let registry = self.poll.registry();
        let mut dead = Vec::new();
        for (&fd, entry) in self.fds.iter_mut() {
            let want = entry.wanted_interest();
            if want != entry.registered {
                let mut source = SourceFd(&fd);
                match (entry.registered, want) {
                    (None, Some(interest)) => {
                        registry.register(&mut source, Token(fd as usize), interest)?
                    }
                    (Some(_), Some(interest)) => {
                        registry.reregister(&mut source, Token(fd as usize), interest)?
                    }
                    (Some(_), None) => {
                        let _ = registry.deregister(&mut source);
                    }
                    (None, None) => {}
                }
                entry.registered = want;
            }
            if want.is_none() {
                dead.push(fd);
            }
        }
        for fd in dead {
            self.fds.remove(&fd);
        }
        self.signals
            .retain(|_, events| events.iter().any(|event| !event.empty()));
        Ok(())
    }

    fn dispatch_signals(&mut self, fired: &mut FiredList) {
        if let Some(fd) = self.sig_pipe_read {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n <= 0 {
                    break;
                }
            }
        }
        for signum in 1..NSIG {
            if SIG_PENDING[signum].swap(false, Ordering::Relaxed) {
                if let Some(events) = self.signals.remove(&(signum as libc::c_int)) {
                    for event in events {
                        fired.push(event);
                    }
                }
            }
        }
    }
}

impl Drop for IoBackend {
    fn drop(&mut self) {
        if let Some(fd) = self.sig_pipe_read.take() {
            let write_fd = SIG_PIPE_WRITE.swap(-1, Ordering::Relaxed);
            unsafe {
                libc::close(fd);
                if write_fd >= 0 {
                    libc::close(write_fd);
                }
            }
        }
    }
}
