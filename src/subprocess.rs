//! Helpers shared by every external process this crate drives.

use std::io::{BufRead, BufReader, Read};
use std::process::Child;
use std::thread::JoinHandle;

/// Forwards each line of `reader` to `sink` on a dedicated thread until EOF.
pub(crate) fn spawn_line_reader<R, F>(
    name: String,
    reader: R,
    mut sink: F,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    let line = line.trim_end().to_string();
                    if !line.is_empty() {
                        sink(line);
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Kills a child that never got handed to its owner and reaps it.
pub(crate) fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::debug!("kill pid {}: {}", child.id(), err);
    }
    if let Err(err) = child.wait() {
        log::debug!("wait for pid {}: {}", child.id(), err);
    }
}

/// Asks a child to exit (SIGTERM on unix, kill elsewhere).
pub(crate) fn request_exit(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(child.id())
            .map_err(|_| std::io::Error::other("child pid out of range"))?;
        // SAFETY: plain syscall on a pid we own and have not reaped yet.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        child.kill()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    #[test]
    fn reap_kills_and_collects_the_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let started = Instant::now();
        reap(&mut child);
        assert!(started.elapsed() < Duration::from_secs(10));
        let status = child.try_wait().unwrap().expect("child already collected");
        assert!(!status.success());
    }

    #[test]
    fn reap_tolerates_an_exited_child() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        reap(&mut child);
        assert!(child.try_wait().unwrap().is_some());
    }
}
