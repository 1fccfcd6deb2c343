//! Result publisher: one record file per enabled consumer, plus a console echo.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::core::{CanonicalResult, TimeFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub consumer: String,
    pub time_format: TimeFormat,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRecord {
    pub consumer: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWarning {
    pub consumer: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub written: Vec<WrittenRecord>,
    pub warnings: Vec<DeliveryWarning>,
}

impl PublishOutcome {
    pub fn merge(&mut self, other: PublishOutcome) {
        self.written.extend(other.written);
        self.warnings.extend(other.warnings);
    }
}

pub fn render_for(result: &CanonicalResult, consumer: &ConsumerConfig) -> ConsumerRecord {
    ConsumerRecord {
        consumer: consumer.name.clone(),
        time_format: consumer.timestamp,
        text: result.render(consumer.timestamp),
    }
}

/// Writes `result` into `<spool_root>/<consumer>/` for every consumer and echoes the
/// local-time rendering to `console`. Undeliverable consumers are skipped with a warning.
pub fn publish(
    result: &CanonicalResult,
    consumers: &[ConsumerConfig],
    spool_root: &Path,
    console: &mut dyn Write,
) -> PublishOutcome {
    let mut outcome = PublishOutcome::default();

    for consumer in consumers {
        let record = render_for(result, consumer);
        let dir = spool_root.join(&consumer.name);
        match write_record(&dir, result.metric_name(), &record.text) {
            Ok(path) => {
                info!(consumer = %consumer.name, path = %path.display(), "created consumer record");
                outcome.written.push(WrittenRecord {
                    consumer: consumer.name.clone(),
                    path,
                });
            }
            Err(e) => {
                warn!(consumer = %consumer.name, dir = %dir.display(), error = %e, "cannot write record for consumer");
                outcome.warnings.push(DeliveryWarning {
                    consumer: consumer.name.clone(),
                    message: format!("cannot write record to {}: {e}", dir.display()),
                });
            }
        }
    }

    if let Err(e) = console.write_all(result.render(TimeFormat::Local).as_bytes()) {
        warn!(error = %e, "failed to echo result");
    }
    let _ = console.flush();

    outcome
}

fn write_record(dir: &Path, metric: &str, text: &str) -> io::Result<PathBuf> {
    ensure_spool_dir(dir)?;

    let name = unique_name(metric);
    let tmp = dir.join(format!(".{name}.tmp"));
    let path = dir.join(&name);

    let res = (|| {
        let mut file = File::options().write(true).create_new(true).open(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res.map(|_| path)
}

fn ensure_spool_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    debug!(dir = %dir.display(), "creating consumer spool directory");
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(dir)
}

/// `<metric>.<pid>-<nanos>-<seq>`
fn unique_name(metric: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{metric}.{}-{nanos}-{seq}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timestamp::parse_utc;
    use crate::core::{RecordIdentity, Status};

    fn temp_root(name: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "rsvrun-publish-{name}-{}-{seq}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn result() -> CanonicalResult {
        CanonicalResult::brief(
            RecordIdentity {
                metric_name: "org.osg.general.ping-host".to_string(),
                metric_type: "status".to_string(),
                service_type: "OSG-CE".to_string(),
                service_uri: "ce.example.org".to_string(),
                gathered_at: "rsv.example.org".to_string(),
            },
            Status::Ok,
            "Host reachable",
            parse_utc("2010-07-25T05:18:14Z").expect("ts"),
        )
    }

    fn consumer(name: &str, timestamp: TimeFormat) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_string(),
            timestamp,
        }
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        let mut v: Vec<PathBuf> = fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default();
        v.sort();
        v
    }

    #[test]
    fn writes_one_file_per_consumer_with_its_time_format() {
        let root = temp_root("two");
        let consumers = [
            consumer("html-consumer", TimeFormat::Utc),
            consumer("gratia-consumer", TimeFormat::Epoch),
        ];
        let mut console = Vec::new();
        let outcome = publish(&result(), &consumers, &root, &mut console);

        assert_eq!(outcome.written.len(), 2);
        assert!(outcome.warnings.is_empty());

        let html = files_in(&root.join("html-consumer"));
        assert_eq!(html.len(), 1);
        let name = html[0].file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("org.osg.general.ping-host."), "name={name}");
        let text = fs::read_to_string(&html[0]).expect("read");
        assert!(text.contains("timestamp: 2010-07-25T05:18:14Z\n"));

        let gratia = files_in(&root.join("gratia-consumer"));
        let text = fs::read_to_string(&gratia[0]).expect("read");
        assert!(text.contains("timestamp: 1280035094\n"));
        assert!(text.ends_with("EOT\n"));

        let echoed = String::from_utf8(console).expect("utf8");
        assert!(echoed.starts_with("metricName: org.osg.general.ping-host\n"));
        assert!(echoed.ends_with("EOT\n"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn echoes_even_without_consumers() {
        let root = temp_root("none");
        let mut console = Vec::new();
        let outcome = publish(&result(), &[], &root, &mut console);
        assert_eq!(outcome, PublishOutcome::default());
        assert!(!console.is_empty());
        assert!(files_in(&root).is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn unwritable_consumer_is_skipped_with_a_warning() {
        let root = temp_root("blocked");
        // A plain file where the consumer directory should be.
        fs::write(root.join("broken-consumer"), b"not a dir").expect("write");
        let consumers = [
            consumer("broken-consumer", TimeFormat::Utc),
            consumer("html-consumer", TimeFormat::Local),
        ];
        let mut console = Vec::new();
        let outcome = publish(&result(), &consumers, &root, &mut console);

        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.written[0].consumer, "html-consumer");
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].consumer, "broken-consumer");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn repeated_publishes_never_overwrite() {
        let root = temp_root("unique");
        let consumers = [consumer("html-consumer", TimeFormat::Utc)];
        let mut console = Vec::new();
        publish(&result(), &consumers, &root, &mut console);
        publish(&result(), &consumers, &root, &mut console);
        let files = files_in(&root.join("html-consumer"));
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| !p.to_string_lossy().ends_with(".tmp")));
        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn created_spool_dir_is_restrictive() {
        use std::os::unix::fs::PermissionsExt;
        let root = temp_root("mode");
        let mut console = Vec::new();
        publish(&result(), &[consumer("nagios-consumer", TimeFormat::Utc)], &root, &mut console);
        let mode = fs::metadata(root.join("nagios-consumer"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o007, 0, "mode={mode:o}");
        let _ = fs::remove_dir_all(&root);
    }
}
