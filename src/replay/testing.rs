//! Scripted stand-in for `rr replay -i=mi`, used by the replay tests

use crate::replay::types::RrConfig;
use std::time::Duration;

/// Behaves like a small MI debugger: prompt on start, canned replies per
/// command. A leading numeric token is echoed on result records the way
/// gdb does. `$1` is the trace directory.
pub const FAKE_RR_SCRIPT: &str = r##"
echo 'starting replay' >&2
cat <<'EOF'
=thread-group-added,id="i1"
~"GNU gdb (GDB) 14.2\n"
(rr)
EOF
while IFS= read -r line; do
  token=${line%%[!0-9]*}
  cmd=${line#"$token"}
  case "$cmd" in
    -gdb-exit)
      echo "${token}^exit"
      exit 0
      ;;
    c|continue|-exec-continue)
      echo "${token}^running"
      cat <<'EOF'
*running,thread-id="all"
(rr)
~"Continuing.\n"
*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={addr="0x0000000000401136",func="main",args=[],file="crash.c",fullname="/src/crash.c",line="5"},thread-id="1",stopped-threads="all"
(rr)
EOF
      ;;
    reverse-continue|rc)
      echo "${token}^running"
      cat <<'EOF'
*running,thread-id="all"
(rr)
*stopped,reason="no-history",frame={addr="0x00007f0000001000",func="_start"},thread-id="1"
(rr)
EOF
      ;;
    bt|backtrace)
      printf '%s\n' '~"#0  main () at crash.c:5\n"'
      echo "${token}^done"
      echo '(rr)'
      ;;
    where-trace)
      printf '~"%s"\n%s^done\n(rr)\n' "$1" "$token"
      ;;
    badcmd)
      printf '%s%s\n' "$token" '^error,msg="Undefined command: \"badcmd\".  Try \"help\"."'
      echo '(rr)'
      ;;
    noise)
      cat <<'EOF'
this line is not MI
=library-loaded,id="/lib/libc.so.6",target-name="/lib/libc.so.6"
EOF
      ;;
    slow)
      sleep 0.5
      printf '%s%s\n' "$token" '^done,who="slow"'
      echo '(rr)'
      ;;
    closein)
      exec 0<&-
      echo "${token}^done"
      echo '(rr)'
      sleep 30
      exit 0
      ;;
    hang)
      sleep 30
      ;;
    crash)
      echo 'fatal: replay diverged' >&2
      exit 3
      ;;
    *)
      echo "${token}^done,who=\"${cmd}\""
      echo '(rr)'
      ;;
  esac
done
"##;

/// Config that runs [`FAKE_RR_SCRIPT`] through `/bin/sh`
pub fn fake_rr_config() -> RrConfig {
    script_config(FAKE_RR_SCRIPT)
}

pub fn script_config(script: &str) -> RrConfig {
    RrConfig {
        rr_path: "/bin/sh".to_string(),
        rr_args: vec!["-c".to_string(), script.to_string(), "fake-rr".to_string()],
        handshake_timeout: Duration::from_secs(10),
        command_timeout: Duration::from_secs(10),
        execution_timeout: Duration::from_secs(10),
        exit_grace: Duration::from_secs(2),
        ..RrConfig::default()
    }
}

/// Whether a pid still names a process (zombies count)
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Like [`pid_alive`], but a zombie left for init to reap counts as gone
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State follows the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) if std::path::Path::new("/proc/self").exists() => false,
        Err(_) => pid_alive(pid),
    }
}
