//! Host identification for task records.

use sysinfo::System;

/// Name of the machine this process runs on.
pub fn hostname() -> Option<String> {
    System::host_name().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_not_blank() {
        if let Some(name) = hostname() {
            assert!(!name.trim().is_empty());
        }
    }
}
