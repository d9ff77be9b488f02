#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use aria_engine::download::events::EngineEvent;
use aria_engine::Settings;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Stands in for yt-dlp. Behaviour is keyed on the URL's `v=` value:
/// `fail*` exits 1 with a network error, `flaky` fails only the first time,
/// `slow` hangs until killed, `notitle` has no title, `slowtitle` hangs in the
/// title lookup. Everything else downloads and merges one file.
const SCRIPT: &str = r#"#!/bin/sh
DIR='@DIR@'
for last; do :; done
case "$1" in
  --skip-download)
    case "$last" in
      *notitle*) echo "ERROR: Unsupported URL: $last" >&2; exit 1 ;;
      *slowtitle*) sleep 30 ;;
    esac
    echo "Title ${last##*=}"
    exit 0 ;;
  --flat-playlist)
    case "$last" in
      *list=ONE*) echo '{"id":"solo","title":"Solo","url":"https://e.com/watch?v=solo"}' ;;
      *list=EMPTY*) echo "ERROR: The playlist does not exist" >&2; exit 1 ;;
      *)
        echo 'not json'
        for i in 1 2 3; do
          echo "{\"id\":\"m$i\",\"title\":\"Member $i\",\"url\":\"https://e.com/watch?v=m$i\"}"
        done ;;
    esac
    exit 0 ;;
esac

url="$1"
id="${url##*=}"
echo "$url" >> "$DIR/calls.log"

case " $* " in
  *" --yes-playlist "*)
    for i in 1 2; do
      echo "[download] Downloading item $i of 2"
      echo "[download] Destination: $DIR/P/0$i.webm"
      echo "[download] 100.0% of ~1.00MiB at 1.00MiB/s ETA 00:00"
      echo "[Merger] Merging formats into \"$DIR/P/0$i - Track [$i].mp4\""
    done
    exit 0 ;;
esac

case "$id" in
  fail*)
    echo "[download] Destination: $DIR/$id.webm"
    echo "WARNING: retrying" >&2
    echo "ERROR: network timeout" >&2
    exit 1 ;;
  flaky)
    if [ ! -f "$DIR/flaky.seen" ]; then
      touch "$DIR/flaky.seen"
      echo "ERROR: HTTP Error 503: Service Unavailable" >&2
      exit 1
    fi ;;
  slow)
    echo "[download] Destination: $DIR/$id.webm"
    echo "[download]   1.0% of ~10.00MiB at 1.00MiB/s ETA 00:09"
    sleep 30
    exit 0 ;;
esac

echo "[download] Destination: $DIR/$id.f137.mp4"
echo "[download]  50.0% of ~10.00MiB at 2.00MiB/s ETA 00:02"
printf '[download] 100.0%% of ~10.00MiB at 2.00MiB/s ETA 00:00\r'
echo "[Merger] Merging formats into \"$DIR/$id [x].mp4\""
exit 0
"#;

pub const WAIT: Duration = Duration::from_secs(20);

pub struct FakeTool {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FakeTool {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-yt-dlp");
        let body = SCRIPT.replace("@DIR@", &dir.path().to_string_lossy());
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        FakeTool { dir, path }
    }

    pub fn tool(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn settings(&self, retry_failed_once: bool) -> Settings {
        Settings {
            download_directory: self.dir.path().to_string_lossy().to_string(),
            downloader_path: self.tool(),
            retry_failed_once,
            history_file: Some(self.history_path().to_string_lossy().to_string()),
            ..Settings::default()
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.path().join("history.json")
    }

    /// URLs the fake was asked to download, in call order.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

pub fn url(id: &str) -> String {
    format!("https://e.com/watch?v={id}")
}

/// Collect bus events up to and including `SessionFinished`.
pub async fn until_session_finished(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        let ev = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("session did not finish in time")
            .expect("bus closed");
        let done = matches!(ev, EngineEvent::SessionFinished { .. });
        events.push(ev);
        if done {
            return events;
        }
    }
}
