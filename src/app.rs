//! Shared state for one invocation: the repository and the resolved
//! options. Command implementations hang off this struct from their own
//! modules (filters, transform, list, setup, rawlog).

use std::io::Read;
use std::path::Path;

use crate::config::{OptionFlags, Options};
use crate::error::Result;
use crate::repo::Repo;

pub struct App {
    pub repo: Repo,
    pub opts: Options,
}

impl App {
    pub fn new(flags: &OptionFlags) -> Result<Self> {
        let repo = Repo::discover()?;
        let opts = Options::resolve(&repo, flags)?;
        Ok(Self { repo, opts })
    }

    pub fn get_input(&self, path: &str, stdin: bool) -> Result<Vec<u8>> {
        if stdin {
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data)?;
            Ok(data)
        } else {
            Ok(std::fs::read(self.repo.abs_path(path))?)
        }
    }

    /// Exercise the mangle / store round trip on a file and print the
    /// result, without any cryptography involved.
    pub fn test_mangle(&self, path: &str, mangle: bool) -> Result<()> {
        let mut input = self.get_input(path, false)?;
        if mangle {
            input = self.opts.mangle.mangle(&input, path, false);
        }
        let branch = crate::engine::store::parse(&String::from_utf8_lossy(&input))?;
        let mut output = crate::engine::store::emit(&branch, self.opts.indent).into_bytes();
        if mangle {
            output = self.opts.mangle.demangle(&output, path, false)?;
        }
        print!("{}", String::from_utf8_lossy(&output));
        Ok(())
    }
}

/// Rewrite a file in place, keeping its permissions and optionally its
/// timestamps (merge inputs must not look modified afterwards).
pub fn overwrite_file(path: impl AsRef<Path>, data: &[u8], keep_times: bool) -> Result<()> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified();
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, meta.permissions())?;
    }
    if keep_times {
        if let Ok(mtime) = modified {
            let times = std::fs::FileTimes::new().set_modified(mtime);
            let file = std::fs::File::options().write(true).open(path)?;
            file.set_times(times)?;
        }
    }
    Ok(())
}
