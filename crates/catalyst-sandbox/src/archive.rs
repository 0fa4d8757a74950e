//! In-memory tar archive carrying the automation script.

use bytes::Bytes;

/// Entry name inside the archive; extracted at `/` it becomes `/script`.
pub const SCRIPT_ENTRY: &str = "script";
/// Where the archive is unpacked inside the container.
pub const UPLOAD_PATH: &str = "/";
/// Command path of the script inside the container.
pub const SCRIPT_PATH: &str = "/script";

/// Build a single-file archive holding `script` as an executable.
pub fn script_archive(script: &str) -> std::io::Result<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, SCRIPT_ENTRY, script.as_bytes())?;
    let data = builder.into_inner()?;
    Ok(Bytes::from(data))
}
