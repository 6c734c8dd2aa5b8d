//! Reference parsing and the file checks shared by file-based resolvers.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::ReferenceResolution;

/// Splits `path[:filter]`.
///
/// A reference naming an existing file is never split, so paths that
/// contain `:` keep working.
pub fn split(reference: &str) -> (&str, Option<&str>) {
    if Path::new(reference).exists() {
        return (reference, None);
    }
    match reference.rsplit_once(':') {
        Some((path, filter)) if !path.is_empty() => {
            let filter = (!filter.is_empty()).then_some(filter);
            (path, filter)
        }
        _ => (reference, None),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FileCheck {
    /// A readable regular file, optionally with a required suffix.
    Readable { suffix: Option<&'static str> },
    /// A regular file with at least one executable bit set.
    Executable,
}

/// Checks `path` against `check`, returning the NOTFOUND resolution to
/// hand back when it does not qualify.
pub fn check_file(path: &str, reference: &str, check: FileCheck) -> Result<(), ReferenceResolution> {
    if let FileCheck::Readable {
        suffix: Some(suffix),
    } = check
    {
        if !path.ends_with(suffix) {
            return Err(ReferenceResolution::not_found(
                reference,
                format!("File path \"{path}\" does not end with \"{suffix}\""),
            ));
        }
    }

    let type_name = match check {
        FileCheck::Readable { .. } => "regular file",
        FileCheck::Executable => "executable file",
    };
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            return Err(ReferenceResolution::not_found(
                reference,
                format!("File \"{path}\" does not exist or is not a {type_name}"),
            ))
        }
    };

    match check {
        FileCheck::Readable { .. } => {
            if std::fs::File::open(path).is_err() {
                return Err(ReferenceResolution::not_found(
                    reference,
                    format!("File \"{path}\" does not exist or is not readable"),
                ));
            }
        }
        FileCheck::Executable => {
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(ReferenceResolution::not_found(
                    reference,
                    format!("File \"{path}\" does not exist or is not executable"),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{check_file, split, FileCheck};
    use avocado_test_utils::write_script;

    #[test]
    fn split_filter() {
        assert_eq!(
            split("no/such/passtest.py:PassTest.test"),
            ("no/such/passtest.py", Some("PassTest.test"))
        );
        assert_eq!(split("no/such/passtest.py"), ("no/such/passtest.py", None));
        assert_eq!(split("no/such/passtest.py:"), ("no/such/passtest.py", None));
    }

    #[test]
    fn existing_paths_are_not_split() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird:name.sh");
        std::fs::write(&path, "").unwrap();
        let reference = path.to_str().unwrap();
        assert_eq!(split(reference), (reference, None));
    }

    #[test]
    fn check_messages() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.py");
        let missing = missing.to_str().unwrap();

        let err = check_file(missing, missing, FileCheck::Readable { suffix: Some(".py") })
            .unwrap_err();
        assert_eq!(
            err.info.unwrap(),
            format!("File \"{missing}\" does not exist or is not a regular file")
        );

        let err = check_file("x.sh", "x.sh", FileCheck::Readable { suffix: Some(".py") })
            .unwrap_err();
        assert_eq!(err.info.unwrap(), "File path \"x.sh\" does not end with \".py\"");
    }

    #[test]
    fn executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.sh");
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        let plain = plain.to_str().unwrap();
        assert!(check_file(plain, plain, FileCheck::Executable).is_err());

        let script = write_script(dir.path(), "exec.sh", "exit 0");
        let script = script.to_str().unwrap();
        assert!(check_file(script, script, FileCheck::Executable).is_ok());
    }
}
