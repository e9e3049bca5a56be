//! Syscall number table, parsed from the kernel's generic unistd header.

use std::collections::HashMap;
use std::fs;

use crate::error::{Error, Result};

const UNISTD_PATH: &str = "/usr/include/asm-generic/unistd.h";

/// Parse `#define __NR_<name> <n>` and `#define __NR3264_<name> <n>`
/// lines into number → name.
pub fn parse_unistd(text: &str) -> HashMap<i64, String> {
    let mut table = HashMap::new();
    for line in text.lines() {
        let rest = if let Some(rest) = line.strip_prefix("#define __NR_") {
            rest
        } else if let Some(rest) = line.strip_prefix("#define __NR3264_") {
            rest
        } else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(name), Some(number)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(number) = number.parse::<i64>() else {
            // Aliases like `#define __NR_fcntl __NR3264_fcntl` and
            // arithmetic definitions are skipped.
            continue;
        };
        table.insert(number, name.to_string());
    }
    table
}

pub fn load_syscall_table() -> Result<HashMap<i64, String>> {
    let text = fs::read_to_string(UNISTD_PATH)
        .map_err(|_| Error::SyscallTableUnavailable(UNISTD_PATH.to_string()))?;
    Ok(parse_unistd(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNISTD: &str = "\
#define __NR_io_setup 0
__SYSCALL(__NR_io_setup, sys_io_setup)
#define __NR_io_destroy 1
#define __NR3264_fcntl 25
#define __NR_fcntl __NR3264_fcntl
#define __NR_write 64
#define __NR_syscalls 452
";

    #[test]
    fn parses_plain_and_3264_defines() {
        let table = parse_unistd(UNISTD);
        assert_eq!(table[&0], "io_setup");
        assert_eq!(table[&25], "fcntl");
        assert_eq!(table[&64], "write");
        // The alias line has no numeric value and is skipped.
        assert_eq!(table.len(), 5);
    }
}
