//! 后台保存：同一集合同时最多一个写盘任务，抢不到就放弃本次保存（不排队、不重试）。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use slidemark_core::annotation::{AnnotationSet, AnnotationSnapshot, SaveState};

use crate::{AnnotationSaver, IoError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// 已写盘；`backup` 为本次新建的 `.orig` 备份。
    Written { backup: Option<PathBuf> },
    /// 另一个保存任务持有标志，本次被跳过。
    Skipped,
}

/// `slide.xml` → `slide.xml.orig`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".orig");
    PathBuf::from(name)
}

/// 在调用线程上完成一次保存：抢占标志 → 首次覆盖前备份 → 写盘 → 记录已保存代数。
///
/// 另存为其他路径时不记录已保存代数，集合仍视为有未保存修改。
pub fn save_snapshot(
    snapshot: &AnnotationSnapshot,
    state: &SaveState,
    path: &Path,
    saver: &impl AnnotationSaver,
) -> Result<SaveOutcome, IoError> {
    let Some(_claim) = state.try_claim() else {
        debug!(path = %path.display(), "已有保存任务在进行，跳过本次保存");
        return Ok(SaveOutcome::Skipped);
    };

    let backup = if snapshot.backup_on_save {
        create_backup(path)?
    } else {
        None
    };
    saver.save(&snapshot.store, path)?;
    if snapshot.saves_source(path) {
        state.record_saved(snapshot.generation);
    }
    info!(
        path = %path.display(),
        annotations = snapshot.store.annotation_count(),
        generation = snapshot.generation,
        "标注已保存"
    );
    Ok(SaveOutcome::Written { backup })
}

fn create_backup(path: &Path) -> Result<Option<PathBuf>, IoError> {
    let backup = backup_path(path);
    if backup.exists() || !path.exists() {
        return Ok(None);
    }
    fs::rename(path, &backup).map_err(|source| IoError::WriteError {
        path: backup.clone(),
        source,
    })?;
    info!(from = %path.display(), to = %backup.display(), "已创建备份");
    Ok(Some(backup))
}

/// 外部提供的任务提交能力（线程池、运行时等）。
pub trait TaskSubmitter {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// 每个任务一个线程，保留句柄以便退出前等待。
#[derive(Debug, Default)]
pub struct ThreadSubmitter {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待所有已提交的任务结束。
    pub fn join_all(&self) {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                warn!("后台保存线程异常退出");
            }
        }
    }
}

impl TaskSubmitter for ThreadSubmitter {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        let handle = thread::spawn(task);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

/// 直接在调用线程上执行。
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSubmitter;

impl TaskSubmitter for InlineSubmitter {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

/// 深拷贝集合后把写盘交给 `submitter`。后台任务只接触快照和共享的保存标志，
/// 保存期间的新修改不会被清除修改标志，会由下一次保存写出。
///
/// 仅当 `path` 就是集合的来源文件时才会在首次覆盖前备份。
pub fn save_async<S>(
    set: &AnnotationSet,
    path: &Path,
    saver: S,
    create_backup: bool,
    submitter: &dyn TaskSubmitter,
) where
    S: AnnotationSaver + Send + 'static,
{
    let mut snapshot = set.snapshot();
    snapshot.backup_on_save =
        snapshot.backup_on_save && create_backup && set.source_path() == Some(path);
    let state = Arc::clone(set.save_state());
    let path = path.to_path_buf();
    submitter.submit(Box::new(move || {
        if let Err(err) = save_snapshot(&snapshot, &state, &path, &saver) {
            warn!(path = %path.display(), error = %err, "后台保存失败");
        }
    }));
}

/// 自动保存节流：有未保存修改、空闲足够久、且距上次保存超过间隔时才保存。
#[derive(Debug, Clone)]
pub struct AutosaveThrottle {
    interval: Duration,
    idle: Duration,
    last_save: Option<Instant>,
}

impl AutosaveThrottle {
    pub fn new(interval: Duration, idle: Duration) -> Self {
        Self {
            interval,
            idle,
            last_save: None,
        }
    }

    pub fn should_save(&self, set: &AnnotationSet, now: Instant) -> bool {
        if !set.is_modified() || set.save_state().is_saving() {
            return false;
        }
        let Some(modified) = set.last_modified() else {
            return false;
        };
        if now.saturating_duration_since(modified) < self.idle {
            return false;
        }
        self.last_save
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn record_save(&mut self, now: Instant) {
        self.last_save = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use slidemark_core::annotation::{Annotation, AnnotationType, GroupId};
    use slidemark_core::geometry::{Point2, Vector2};

    use super::*;
    use crate::AsapXml;

    fn snapshot_with_point(backup_on_save: bool) -> AnnotationSnapshot {
        let mut set = AnnotationSet::new(Vector2::new(1.0, 1.0));
        set.store_mut().push_annotation(Annotation::new(
            AnnotationType::Point,
            vec![Point2::new(1.0, 1.0)],
            GroupId::NONE,
        ));
        set.mark_modified();
        let mut snapshot = set.snapshot();
        snapshot.backup_on_save = backup_on_save;
        snapshot
    }

    #[test]
    fn backup_is_created_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.xml");
        fs::write(&path, "original").unwrap();
        let snapshot = snapshot_with_point(true);
        let state = SaveState::default();

        let outcome = save_snapshot(&snapshot, &state, &path, &AsapXml::new()).unwrap();
        let backup = backup_path(&path);
        assert_eq!(outcome, SaveOutcome::Written { backup: Some(backup.clone()) });
        assert_eq!(fs::read_to_string(&backup).unwrap(), "original");
        assert!(fs::read_to_string(&path).unwrap().contains("ASAP_Annotations"));
        assert_eq!(state.saved_generation(), snapshot.generation);

        let outcome = save_snapshot(&snapshot, &state, &path, &AsapXml::new()).unwrap();
        assert_eq!(outcome, SaveOutcome::Written { backup: None });
        assert_eq!(fs::read_to_string(&backup).unwrap(), "original");
    }

    #[test]
    fn claimed_state_skips_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.xml");
        let snapshot = snapshot_with_point(false);
        let state = SaveState::default();

        let claim = state.try_claim().unwrap();
        let outcome = save_snapshot(&snapshot, &state, &path, &AsapXml::new()).unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped);
        assert!(!path.exists());
        drop(claim);

        let outcome = save_snapshot(&snapshot, &state, &path, &AsapXml::new()).unwrap();
        assert_eq!(outcome, SaveOutcome::Written { backup: None });
    }

    #[test]
    fn saving_a_copy_keeps_source_modified() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("slide.xml");
        let copy = dir.path().join("copy.xml");
        let mut snapshot = snapshot_with_point(false);
        snapshot.source_path = Some(source.clone());
        let state = SaveState::default();

        save_snapshot(&snapshot, &state, &copy, &AsapXml::new()).unwrap();
        assert!(copy.exists());
        assert_eq!(state.saved_generation(), 0);

        save_snapshot(&snapshot, &state, &source, &AsapXml::new()).unwrap();
        assert_eq!(state.saved_generation(), snapshot.generation);
    }

    #[test]
    fn throttle_waits_for_idle_and_interval() {
        let mut throttle = AutosaveThrottle::new(Duration::from_secs(60), Duration::from_secs(2));
        let mut set = AnnotationSet::new(Vector2::new(1.0, 1.0));
        let start = Instant::now();
        assert!(!throttle.should_save(&set, start));

        set.mark_modified();
        let later = Instant::now() + Duration::from_secs(3);
        assert!(throttle.should_save(&set, later));
        throttle.record_save(later);

        set.mark_modified();
        assert!(!throttle.should_save(&set, later + Duration::from_secs(10)));
        assert!(throttle.should_save(&set, later + Duration::from_secs(61)));

        let _claim = set.save_state().try_claim().unwrap();
        assert!(!throttle.should_save(&set, later + Duration::from_secs(61)));
    }
}
