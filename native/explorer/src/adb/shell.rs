//! Device shell command lines. Every builder returns tokens that are already quoted for
//! the device shell, so they can be joined with spaces as-is.

/// Single-quotes `text` for a POSIX shell
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn with_trailing_slash(directory: &str) -> String {
    if directory.ends_with('/') { directory.to_string() } else { format!("{directory}/") }
}

fn tokens<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Long listing of a directory's contents, dotfiles included
pub fn list(directory: &str) -> Vec<String> {
    let mut argv = tokens(["ls", "-a", "-l"]);
    argv.push(quote(&with_trailing_slash(directory)));
    argv
}

/// Long listing of a single node
pub fn stat(path: &str) -> Vec<String> {
    let mut argv = tokens(["ls", "-l", "-d"]);
    argv.push(quote(path));
    argv
}

/// Long listing of whatever `path` resolves to when followed as a directory
pub fn link_kind_check(path: &str) -> Vec<String> {
    stat(&with_trailing_slash(path))
}

/// Every entry of `directory` that resolves to a directory, printed with a trailing slash.
/// The second glob picks up hidden entries.
pub fn list_directories(directory: &str) -> Vec<String> {
    let directory = quote(&with_trailing_slash(directory));
    let mut argv = tokens(["ls", "-a", "-d"]);
    argv.push(format!("{directory}*/"));
    argv.push(format!("{directory}.*/"));
    argv
}

pub fn remove(path: &str, recursive: bool) -> Vec<String> {
    let mut argv = if recursive { tokens(["rm", "-r", "-f"]) } else { tokens(["rm", "-f"]) };
    argv.push(quote(path));
    argv
}

pub fn rename(from: &str, to: &str) -> Vec<String> {
    vec!["mv".to_string(), quote(from), quote(to)]
}

pub fn mkdir(path: &str) -> Vec<String> {
    vec!["mkdir".to_string(), quote(path)]
}

pub fn cat(path: &str) -> Vec<String> {
    vec!["cat".to_string(), quote(path)]
}

/// Long listing of several nodes in one call, links not followed
pub fn stat_all<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut argv = tokens(["ls", "-l", "-d"]);
    argv.extend(paths.iter().map(|p| quote(p.as_ref())));
    argv
}

pub fn getprop(key: &str) -> Vec<String> {
    vec!["getprop".to_string(), key.to_string()]
}

/// Runs the command through `su` when `privileged` is set
pub fn wrap(argv: &[String], privileged: bool) -> Vec<String> {
    if privileged {
        vec!["su".to_string(), "-c".to_string(), quote(&argv.join(" "))]
    } else {
        argv.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn listing_commands() {
        assert_eq!(list("/sdcard").join(" "), "ls -a -l '/sdcard/'");
        assert_eq!(list("/").join(" "), "ls -a -l '/'");
        assert_eq!(list_directories("/sdcard").join(" "), "ls -a -d '/sdcard/'*/ '/sdcard/'.*/");
        assert_eq!(link_kind_check("/sdcard/cache").join(" "), "ls -l -d '/sdcard/cache/'");
        assert_eq!(remove("/sdcard/x y", true).join(" "), "rm -r -f '/sdcard/x y'");
        assert_eq!(stat_all(&["/etc", "/d"]).join(" "), "ls -l -d '/etc' '/d'");
    }

    #[test]
    fn privileged_wrapping() {
        let argv = wrap(&list("/data"), true);
        assert_eq!(argv.join(" "), r"su -c 'ls -a -l '\''/data/'\'''");
        assert_eq!(wrap(&mkdir("/a"), false), mkdir("/a"));
    }
}
