//! S3-backed persistence for the corpus archive and the coverage reports.
//!
//! The corpus travels as one zip object whose archive expands to a root
//! folder named after the corpus directory (`<repo>_corpus/`). Reports are
//! individual objects keyed by their path relative to the report directory.
//! Uploads are per-key atomic; last writer wins.

use crate::runtime;
use anyhow::Context;
use aws_sdk_s3::primitives::ByteStream;
use fuzzmill_core::util::{ensure_dir, CancelToken};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;

pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    corpus_key: String,
    corpus_dir: PathBuf,
    report_dir: PathBuf,
    zip_path: PathBuf,
}

impl ObjectStore {
    pub fn new(
        bucket: String,
        corpus_key: String,
        corpus_dir: PathBuf,
        report_dir: PathBuf,
    ) -> Self {
        let config = runtime().block_on(
            aws_config::defaults(aws_config::BehaviorVersion::latest()).load(),
        );
        let zip_path = match (corpus_dir.parent(), corpus_dir.file_name()) {
            (Some(parent), Some(name)) => {
                parent.join(format!("{}.zip", name.to_string_lossy()))
            }
            _ => corpus_dir.with_extension("zip"),
        };
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
            corpus_key,
            corpus_dir,
            report_dir,
            zip_path,
        }
    }

    /// Download and expand the corpus archive and fetch all persisted
    /// report histories. A missing corpus object means a fresh project:
    /// the cycle starts with an empty corpus.
    pub fn hydrate(&self, token: &CancelToken) -> anyhow::Result<()> {
        let missing = self
            .download_object(&self.corpus_key, &self.zip_path)
            .context("corpus download failed")?;
        if missing {
            log::info!(
                "corpus object {} not found in {}; starting with an empty corpus",
                self.corpus_key,
                self.bucket
            );
            return Ok(());
        }

        let dest = self
            .corpus_dir
            .parent()
            .context("corpus directory has no parent")?;
        unzip_into(&self.zip_path, dest).context("corpus unzip failed")?;
        log::info!("downloaded and unzipped corpus {}", self.corpus_key);

        self.download_reports(token).context("reports download failed")?;
        Ok(())
    }

    /// Upload the corpus archive and every report file.
    pub fn persist(&self) -> anyhow::Result<()> {
        zip_dir(&self.corpus_dir, &self.zip_path).context("corpus zip failed")?;
        self.upload_file(&self.zip_path, &self.corpus_key, "application/zip")
            .context("corpus upload failed")?;
        log::info!(
            "uploaded corpus {} to bucket {}",
            self.corpus_key,
            self.bucket
        );

        self.upload_reports().context("reports upload failed")?;
        log::info!("uploaded reports to bucket {}", self.bucket);
        Ok(())
    }

    /// Fetch an object into `out`. Returns `true` when the key does not
    /// exist, which is not an error.
    fn download_object(&self, key: &str, out: &Path) -> anyhow::Result<bool> {
        let result = runtime().block_on(
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        );
        let object = match result {
            Ok(object) => object,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    return Ok(true);
                }
                return Err(e).with_context(|| {
                    format!("downloading s3://{}/{}", self.bucket, key)
                });
            }
        };

        let data = runtime()
            .block_on(object.body.collect())
            .with_context(|| format!("reading s3://{}/{}", self.bucket, key))?
            .into_bytes();
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;
        log::info!(
            "downloaded {} bytes from s3://{}/{} to {}",
            data.len(),
            self.bucket,
            key,
            out.display()
        );
        Ok(false)
    }

    fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> anyhow::Result<()> {
        runtime().block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(body)
                .send()
                .await
                .with_context(|| format!("uploading s3://{}/{}", self.bucket, key))?;
            Ok::<_, anyhow::Error>(())
        })?;
        log::debug!("uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    /// Report histories are the only JSON objects in the bucket; fetch them
    /// all so per-day idempotency survives restarts.
    fn download_reports(&self, token: &CancelToken) -> anyhow::Result<()> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();
        loop {
            let page = match runtime().block_on(pages.next()) {
                Some(page) => page.context("failed to list objects")?,
                None => break,
            };
            for object in page.contents() {
                if token.is_canceled() {
                    anyhow::bail!("report download canceled");
                }
                let Some(key) = object.key() else { continue };
                if !key.ends_with(".json") {
                    continue;
                }
                let local = self.report_dir.join(key);
                self.download_object(key, &local)
                    .with_context(|| format!("download report {:?}", key))?;
            }
        }
        Ok(())
    }

    fn upload_reports(&self) -> anyhow::Result<()> {
        let mut files = Vec::new();
        collect_files(&self.report_dir, &mut files)?;
        for path in files {
            let rel = path
                .strip_prefix(&self.report_dir)
                .expect("report file outside report dir");
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            self.upload_file(&path, &key, content_type_for(&path))
                .with_context(|| format!("upload report {:?}", key))?;
        }
        Ok(())
    }
}

/// MIME type by extension, defaulting to a generic binary stream.
fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read dir {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Archive `src_dir` into `zip_path`. Entry names are prefixed with the
/// directory's own name so the archive expands to `<repo>_corpus/...`.
pub fn zip_dir(src_dir: &Path, zip_path: &Path) -> anyhow::Result<()> {
    let root = src_dir
        .file_name()
        .context("corpus directory has no name")?
        .to_string_lossy()
        .into_owned();
    let file =
        File::create(zip_path).with_context(|| format!("creating {}", zip_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.add_directory(format!("{}/", root), options)?;
    let mut files = Vec::new();
    collect_files(src_dir, &mut files)?;
    for path in files {
        let rel = path.strip_prefix(src_dir).expect("file outside corpus dir");
        let name = format!(
            "{}/{}",
            root,
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        );
        zip.start_file(name.as_str(), options)?;
        let mut src = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        io::copy(&mut src, &mut zip).with_context(|| format!("zip {}", path.display()))?;
    }
    zip.finish().context("finalize corpus zip")?;
    Ok(())
}

/// Expand `zip_path` into `dest_dir`, preserving the directory structure.
pub fn unzip_into(zip_path: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let file = File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("opening corpus zip")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            anyhow::bail!("archive entry {:?} escapes the corpus root", entry.name());
        };
        let out = dest_dir.join(rel);
        if entry.is_dir() {
            ensure_dir(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        let mut dst =
            File::create(&out).with_context(|| format!("creating {}", out.display()))?;
        io::copy(&mut entry, &mut dst).with_context(|| format!("extracting {}", out.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corpus_zip_round_trips_with_root_folder() {
        let ws = tempfile::tempdir().unwrap();
        let corpus = ws.path().join("repo_corpus");
        let target = corpus.join("pkg").join("testdata").join("fuzz").join("FuzzFoo");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("771e938e4458e983"), b"go test fuzz v1\n").unwrap();

        let zip_path = ws.path().join("repo_corpus.zip");
        zip_dir(&corpus, &zip_path).unwrap();

        // expand into a fresh workspace, as a new cycle would
        let ws2 = tempfile::tempdir().unwrap();
        unzip_into(&zip_path, ws2.path()).unwrap();
        let restored = ws2
            .path()
            .join("repo_corpus")
            .join("pkg")
            .join("testdata")
            .join("fuzz")
            .join("FuzzFoo")
            .join("771e938e4458e983");
        assert_eq!(fs::read(restored).unwrap(), b"go test fuzz v1\n");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("a/index.html")), "text/html");
        assert_eq!(content_type_for(Path::new("a/state.json")), "application/json");
        assert_eq!(
            content_type_for(Path::new("corpus.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn collect_files_walks_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top"), b"1").unwrap();
        fs::write(dir.path().join("a/b/deep"), b"2").unwrap();
        let mut files = Vec::new();
        collect_files(dir.path(), &mut files).unwrap();
        assert_eq!(files.len(), 2);
    }
}
