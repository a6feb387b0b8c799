use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::process;
use std::time::{Duration, Instant};

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use tempfile::tempdir;
use vigil::daemon::daemonize;
use vigil::pidfile::PidFile;

/// What the detached process observed about itself.
struct Report {
    pid: u32,
    session_leader: bool,
    cwd: String,
    stdio_null: bool,
}

fn gather_report() -> String {
    let pid = process::id();
    let session_leader = unsafe { libc::getsid(0) } == pid as libc::pid_t;
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    format!(
        "ok {pid} {session_leader} {cwd} {}\n",
        stdio_is_null_device()
    )
}

/// Whether fds 0, 1, and 2 all refer to the null device.
fn stdio_is_null_device() -> bool {
    fn ident(fd: libc::c_int) -> Option<(u64, u64)> {
        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        if unsafe { libc::fstat(fd, &mut st) } == 0 {
            Some((st.st_dev as u64, st.st_ino as u64))
        } else {
            None
        }
    }

    let path = CString::new("/dev/null").unwrap();
    let mut null_st = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::stat(path.as_ptr(), &mut null_st) } != 0 {
        return false;
    }
    let null_ident = Some((null_st.st_dev as u64, null_st.st_ino as u64));
    (0..3).all(|fd| ident(fd) == null_ident)
}

/// Forks, daemonizes in the child, and returns what the detached process
/// reported about itself. `close_stdio_first` drops fds 0..=2 in the
/// child before detaching, the state a caretaking init-like parent can
/// leave a service in.
fn run_detach_scenario(dir: &Path, close_stdio_first: bool) -> Report {
    let report_path = dir.join(if close_stdio_first {
        "report-closed"
    } else {
        "report"
    });
    let mut store = PidFile::new("svc");
    store
        .set_path(dir.join(if close_stdio_first {
            "svc-closed.pid"
        } else {
            "svc.pid"
        }))
        .unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => {
            // The invoker exits promptly with status 0 regardless of how
            // the daemon fares.
            let status = waitpid(child, None).unwrap();
            assert!(
                matches!(status, WaitStatus::Exited(_, 0)),
                "invoker: {status:?}"
            );

            let deadline = Instant::now() + Duration::from_secs(10);
            let contents = loop {
                if let Ok(text) = fs::read_to_string(&report_path)
                    && text.ends_with('\n')
                {
                    break text;
                }
                assert!(Instant::now() < deadline, "daemon never reported");
                std::thread::sleep(Duration::from_millis(20));
            };

            let fields: Vec<&str> = contents.trim().split(' ').collect();
            assert_eq!(fields.first(), Some(&"ok"), "daemon said: {contents}");
            assert_eq!(fields.len(), 5, "daemon said: {contents}");
            let report = Report {
                pid: fields[1].parse().unwrap(),
                session_leader: fields[2].parse().unwrap(),
                cwd: fields[3].to_string(),
                stdio_null: fields[4].parse().unwrap(),
            };

            // The intermediate parent records the final pid on its way
            // out; that write races the final child's report, so poll.
            let deadline = Instant::now() + Duration::from_secs(10);
            while store.read() != Some(report.pid) {
                assert!(Instant::now() < deadline, "pid file never appeared");
                std::thread::sleep(Duration::from_millis(20));
            }
            report
        }
        ForkResult::Child => {
            if close_stdio_first {
                for fd in 0..3 {
                    unsafe { libc::close(fd) };
                }
            }
            let line = match daemonize(&store) {
                Ok(()) => gather_report(),
                Err(err) => format!("err {err}\n"),
            };
            let _ = fs::write(&report_path, line);
            process::exit(0);
        }
    }
}

#[test]
fn daemonize_detaches_and_rebinds_the_final_process() {
    let temp = tempdir().unwrap();

    let report = run_detach_scenario(temp.path(), false);
    assert_ne!(report.pid, process::id());
    assert!(!report.session_leader);
    assert_eq!(report.cwd, "/");
    assert!(report.stdio_null);

    // Same postconditions when the invoker's standard descriptors were
    // already closed: the null device must not be rebound and then shut
    // by accident.
    let report = run_detach_scenario(temp.path(), true);
    assert!(!report.session_leader);
    assert_eq!(report.cwd, "/");
    assert!(report.stdio_null);
}
