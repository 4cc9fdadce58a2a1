//! 파일 저장
//!
//! 완료된 전송만 저장한다. 임시 파일에 쓴 뒤 rename하므로
//! 중간에 실패해도 목적지에 부분 파일이 남지 않는다.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::transfer::TransferId;
use crate::Result;

/// 파일명에 접미사 삽입 (확장자 앞)
///
/// 디렉터리 성분은 제거한다.
///
/// - `notes.txt` → `notes_copy.txt`
/// - `archive` → `archive_copy`
/// - `.bashrc` → `.bashrc_copy`
pub fn derive_name(original: &str, suffix: &str) -> String {
    let file_name = sanitize(original);
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}{}", &file_name[..dot], suffix, &file_name[dot..]),
        _ => format!("{file_name}{suffix}"),
    }
}

/// 경로 성분을 떼어낸 안전한 파일명
pub fn sanitize(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty() && *part != "." && *part != "..")
        .unwrap_or("");
    if base.is_empty() {
        "unnamed".to_string()
    } else {
        base.to_string()
    }
}

/// 이름 없이 도착한 전송의 기본 파일명
pub fn fallback_name(id: TransferId) -> String {
    format!("transfer_{id}")
}

/// 디렉터리 기반 파일 저장소
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `name`으로 저장, 최종 경로 반환
    pub async fn store(&self, bytes: &[u8], name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let name = sanitize(name);
        let path = self.dir.join(&name);
        let tmp = self
            .dir
            .join(format!(".{}.{:08x}.part", name, rand::random::<u32>()));

        if let Err(e) = fs::write(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("저장 완료: {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }
}
