use crate::runtime::Handle;
use crate::task::kinds::blocking_io;
use crate::task::{Fault, Task, TaskKind};
use futures::future::BoxFuture;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File a pread/pwrite task works on: a path opened for the duration of the
/// task, or a file the caller already opened.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    File(Arc<File>),
}

impl FileSource {
    fn open(&self, write: bool) -> io::Result<Arc<File>> {
        match self {
            FileSource::File(file) => Ok(Arc::clone(file)),
            FileSource::Path(path) if write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map(Arc::new),
            FileSource::Path(path) => File::open(path).map(Arc::new),
        }
    }
}

impl From<PathBuf> for FileSource {
    fn from(path: PathBuf) -> Self {
        FileSource::Path(path)
    }
}

impl From<&Path> for FileSource {
    fn from(path: &Path) -> Self {
        FileSource::Path(path.to_path_buf())
    }
}

impl From<&str> for FileSource {
    fn from(path: &str) -> Self {
        FileSource::Path(PathBuf::from(path))
    }
}

impl From<File> for FileSource {
    fn from(file: File) -> Self {
        FileSource::File(Arc::new(file))
    }
}

impl From<Arc<File>> for FileSource {
    fn from(file: Arc<File>) -> Self {
        FileSource::File(file)
    }
}

#[derive(Debug, Clone)]
pub struct PreadRequest {
    pub file: FileSource,
    pub offset: u64,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct PwriteRequest {
    pub file: FileSource,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Reads up to `count` bytes at `offset`. The response is shorter than
/// `count` only at end of file.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pread;

impl TaskKind for Pread {
    type Request = PreadRequest;
    type Response = Vec<u8>;

    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        let PreadRequest {
            file,
            offset,
            count,
        } = task.req.clone();

        Box::pin(async move {
            task.resp = blocking_io(handle, move || {
                let file = file.open(false)?;
                let mut buf = vec![0u8; count];
                let mut read = 0;

                while read < count {
                    match file.read_at(&mut buf[read..], offset + read as u64) {
                        Ok(0) => break,
                        Ok(n) => read += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                buf.truncate(read);
                Ok(buf)
            })
            .await?;

            Ok(())
        })
    }
}

/// Writes all of `data` at `offset`. The response is the number of bytes
/// written.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pwrite;

impl TaskKind for Pwrite {
    type Request = PwriteRequest;
    type Response = usize;

    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        let PwriteRequest { file, offset, data } = task.req.clone();

        Box::pin(async move {
            task.resp = blocking_io(handle, move || {
                let file = file.open(true)?;
                file.write_all_at(&data, offset)?;
                Ok(data.len())
            })
            .await?;

            Ok(())
        })
    }
}
