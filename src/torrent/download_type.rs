use std::path::{Component, PathBuf};

use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;

#[derive(Debug, PartialEq, Clone)]
pub enum DownloadType {
    SingleFile {
        name: String,
        size: usize,
    },
    MultiFile {
        directory_name: String,
        files: Vec<File>,
    },
}

impl DownloadType {
    pub fn name(&self) -> &str {
        match self {
            Self::SingleFile { name, .. } => name,
            Self::MultiFile { directory_name, .. } => directory_name,
        }
    }

    /// Every file of the download in content order, with its path relative to
    /// the storage root.
    pub fn files(&self) -> Vec<File> {
        match self {
            Self::SingleFile { name, size } => vec![File {
                path: PathBuf::from(name),
                size: *size,
            }],
            Self::MultiFile {
                directory_name,
                files,
            } => files
                .iter()
                .map(|file| File {
                    path: PathBuf::from(directory_name).join(&file.path),
                    size: file.size,
                })
                .collect(),
        }
    }
}

impl TryFrom<Value> for DownloadType {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let name: String = value.remove_entry("name")?.try_into()?;
        check_component(&name)?;
        if let Some(length) = value.try_remove_entry("length")? {
            return Ok(DownloadType::SingleFile {
                name,
                size: length.try_into()?,
            });
        }

        if let Some(files) = value.try_remove_entry("files")? {
            let files: Vec<Value> = files.try_into()?;
            let mut result = Vec::with_capacity(files.len());
            for file in files {
                result.push(file.try_into()?);
            }
            return Ok(DownloadType::MultiFile {
                directory_name: name,
                files: result,
            });
        }

        Err(anyhow!("invalid metainfo: neither length nor files present"))
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct File {
    pub path: PathBuf,
    pub size: usize,
}

impl TryFrom<Value> for File {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let size = value.remove_entry("length")?.try_into()?;
        let parts: Vec<Value> = value.remove_entry("path")?.try_into()?;
        if parts.is_empty() {
            return Err(anyhow!("empty file path"));
        }
        let mut path = PathBuf::with_capacity(parts.len());
        for part in parts {
            let part: String = part.try_into()?;
            check_component(&part)?;
            path.push(part);
        }
        Ok(File { path, size })
    }
}

/// Names come from the network and must stay inside the storage root.
fn check_component(part: &str) -> Result<()> {
    let mut components = std::path::Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("invalid path component {:?}", part)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &[&str], length: i64) -> Value {
        let mut parts = Value::list();
        for part in path {
            parts = parts.with_value(Value::string(part));
        }
        Value::dictionary()
            .with_entry("length", Value::Integer(length))
            .with_entry("path", parts)
    }

    #[test]
    fn single_file() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("image.iso"))
            .with_entry("length", Value::Integer(5678));

        let download_type = DownloadType::try_from(value).unwrap();

        assert_eq!(download_type.name(), "image.iso");
        assert_eq!(
            download_type.files(),
            vec![File {
                path: PathBuf::from("image.iso"),
                size: 5678
            }]
        );
    }

    #[test]
    fn multi_file_paths_are_nested_under_name() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("root"))
            .with_entry(
                "files",
                Value::list()
                    .with_value(file(&["dir", "file1"], 12))
                    .with_value(file(&["file2"], 34)),
            );

        let download_type = DownloadType::try_from(value).unwrap();

        let files = download_type.files();
        assert_eq!(files[0].path, PathBuf::from("root/dir/file1"));
        assert_eq!(files[0].size, 12);
        assert_eq!(files[1].path, PathBuf::from("root/file2"));
        assert_eq!(files[1].size, 34);
    }

    #[test]
    fn reject_escaping_paths() {
        let parent = Value::dictionary()
            .with_entry("name", Value::string("root"))
            .with_entry("files", Value::list().with_value(file(&["..", "etc"], 1)));
        let absolute = Value::dictionary()
            .with_entry("name", Value::string("/etc"))
            .with_entry("length", Value::Integer(1));

        assert!(DownloadType::try_from(parent).is_err());
        assert!(DownloadType::try_from(absolute).is_err());
    }

    #[test]
    fn missing_length_and_files() {
        let value = Value::dictionary().with_entry("name", Value::string("foo"));

        assert!(DownloadType::try_from(value).is_err());
    }
}
