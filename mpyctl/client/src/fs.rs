//! Device filesystem operations: Python snippet catalog and record parsing.
//!
//! File bytes travel base64-encoded in both directions. The REPL channel
//! contains framing sentinels and is only guaranteed 7-bit-clean-ish, so raw
//! bytes are never put on the wire.

use crate::error::{Error, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;

/// One entry of a device directory listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FileEntry {
    pub filename: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Result of a remote stat.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatResult {
    pub exists: bool,
    pub is_dir: bool,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
}

/// Input chunk size for uploads. 128 source bytes keep each generated
/// `a2b_base64` line comfortably inside the device line buffer.
pub(crate) const PUT_CHUNK: usize = 128;

/// Quote a path for interpolation into a Python string literal. Every
/// snippet must take user paths through here, so a quote or backslash in a
/// filename cannot break out of the literal.
pub(crate) fn escape_py_str(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub(crate) fn ls_script(dir: &str, recursive: bool) -> String {
    format!(
        "import os\n\
         def _ls(d, rec):\n\
         \x20   for n in os.listdir(d):\n\
         \x20       p = (d + '/' + n) if d != '/' else '/' + n\n\
         \x20       try:\n\
         \x20           st = os.stat(p)\n\
         \x20       except OSError:\n\
         \x20           continue\n\
         \x20       isd = st[0] & 0x4000\n\
         \x20       print(p + ' | ' + ('d' if isd else 'f') + ' | ' + str(st[6]))\n\
         \x20       if isd and rec:\n\
         \x20           _ls(p, rec)\n\
         \x20       pass\n\
         _ls({dir}, {rec})\n",
        dir = escape_py_str(dir),
        rec = if recursive { "True" } else { "False" },
    )
}

pub(crate) fn stat_script(path: &str) -> String {
    format!(
        "import os\n\
         try:\n\
         \x20   st = os.stat({p})\n\
         \x20   print('1,%d,%d,%d,%d' % (1 if st[0] & 0x4000 else 0, st[6], st[7], st[8]))\n\
         except OSError:\n\
         \x20   print('0,0,0,0,0')\n",
        p = escape_py_str(path)
    )
}

pub(crate) fn get_script(path: &str) -> String {
    format!(
        "import ubinascii\n\
         f = open({p}, 'rb')\n\
         while True:\n\
         \x20   b = f.read(1024)\n\
         \x20   if not b:\n\
         \x20       break\n\
         \x20   print(ubinascii.b2a_base64(b).decode().strip())\n\
         f.close()\n\
         print()\n",
        p = escape_py_str(path)
    )
}

pub(crate) fn put_script(path: &str, data: &[u8]) -> String {
    let mut script = String::with_capacity(data.len() * 2 + 64);
    script.push_str("import ubinascii\nf = open(");
    script.push_str(&escape_py_str(path));
    script.push_str(", 'wb')\nw = f.write\n");
    for chunk in data.chunks(PUT_CHUNK) {
        script.push_str("w(ubinascii.a2b_base64('");
        script.push_str(&BASE64.encode(chunk));
        script.push_str("'))\n");
    }
    script.push_str("f.close()\n");
    script
}

pub(crate) fn hash_script(path: &str) -> String {
    format!(
        "import uhashlib, ubinascii\n\
         h = uhashlib.sha256()\n\
         f = open({p}, 'rb')\n\
         while True:\n\
         \x20   b = f.read(1024)\n\
         \x20   if not b:\n\
         \x20       break\n\
         \x20   h.update(b)\n\
         f.close()\n\
         print(ubinascii.hexlify(h.digest()).decode())\n",
        p = escape_py_str(path)
    )
}

pub(crate) fn mkdir_script(path: &str) -> String {
    format!("import os\nos.mkdir({p})\n", p = escape_py_str(path))
}

pub(crate) fn rename_script(old: &str, new: &str) -> String {
    format!(
        "import os\nos.rename({old}, {new})\n",
        old = escape_py_str(old),
        new = escape_py_str(new)
    )
}

/// Removes a file, falling back to `rmdir` when the target is a directory.
pub(crate) fn remove_script(path: &str) -> String {
    format!(
        "import os\n\
         try:\n\
         \x20   os.remove({p})\n\
         except OSError as e:\n\
         \x20   if e.args and e.args[0] == 21:\n\
         \x20       os.rmdir({p})\n\
         \x20   else:\n\
         \x20       raise\n",
        p = escape_py_str(path)
    )
}

/// Parse `path | d|f | size` listing records, sorted by path.
pub(crate) fn parse_listing(stdout: &str) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, " | ");
        let (Some(filename), Some(kind), Some(size)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidResponse(format!(
                "malformed listing record {line:?}"
            )));
        };
        let is_dir = match kind {
            "d" => true,
            "f" => false,
            other => {
                return Err(Error::InvalidResponse(format!(
                    "unknown entry kind {other:?} in {line:?}"
                )));
            }
        };
        let size = size.parse().map_err(|_| {
            Error::InvalidResponse(format!("malformed size in listing record {line:?}"))
        })?;
        entries.push(FileEntry {
            filename: filename.into(),
            is_dir,
            size,
        });
    }
    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(entries)
}

/// Parse the `exists,isdir,size,atime,mtime` CSV tuple.
pub(crate) fn parse_stat(stdout: &str) -> Result<StatResult> {
    let line = stdout.trim();
    let fields: Vec<&str> = line.split(',').collect();
    let &[exists, is_dir, size, atime, mtime] = fields.as_slice() else {
        return Err(Error::InvalidResponse(format!(
            "malformed stat record {line:?}"
        )));
    };
    let number = |field: &str| {
        field
            .parse::<u64>()
            .map_err(|_| Error::InvalidResponse(format!("malformed stat record {line:?}")))
    };
    Ok(StatResult {
        exists: number(exists)? != 0,
        is_dir: number(is_dir)? != 0,
        size: number(size)?,
        atime: number(atime)?,
        mtime: number(mtime)?,
    })
}

/// Decode newline-delimited base64 chunks; an empty line marks EOF.
pub(crate) fn parse_b64_stream(stdout: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let chunk = BASE64
            .decode(line)
            .map_err(|e| Error::InvalidResponse(format!("bad base64 chunk: {e}")))?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Validate and normalize a printed SHA-256 digest.
pub(crate) fn parse_hash(stdout: &str) -> Result<String> {
    let digest = stdout.trim();
    let valid = digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !valid {
        return Err(Error::InvalidResponse(format!(
            "malformed SHA-256 digest {digest:?}"
        )));
    }
    Ok(digest.into())
}

/// Order entries children-before-parents for bottom-up deletion.
pub(crate) fn deepest_first(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        let depth = |e: &FileEntry| e.filename.matches('/').count();
        depth(b)
            .cmp(&depth(a))
            .then_with(|| b.filename.cmp(&a.filename))
    });
}
