use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Commit;

/// Larger length prefixes can only come from a damaged file.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Bytes a frame adds around its payload: length prefix and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Outcome of reading one frame.
enum Frame {
    Payload(Vec<u8>),
    /// Clean end of file on a frame boundary.
    End,
    /// The file ends inside a frame, as after a crash mid-write.
    Torn,
    /// Length or checksum does not hold up.
    Corrupt,
}

fn write_frame(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(false)` when the reader runs dry before `buf` is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf[..1])? {
        0 => return Ok(Frame::End),
        _ if !fill(reader, &mut len_buf[1..])? => return Ok(Frame::Torn),
        _ => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Corrupt);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Corrupt);
    }
    Ok(Frame::Payload(payload))
}

/// Commits that decode cleanly from the head of the file, and the byte
/// length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Commit>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut commits = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let payload = match read_frame(&mut reader)? {
            Frame::Payload(payload) => payload,
            Frame::End => break,
            Frame::Torn => {
                warn!(path = %path.display(), offset = valid_len, "WAL ends inside a frame");
                break;
            }
            Frame::Corrupt => {
                warn!(path = %path.display(), offset = valid_len, "WAL frame failed its checksum");
                break;
            }
        };
        match bincode::deserialize::<Commit>(&payload) {
            Ok(commit) => commits.push(commit),
            Err(e) => {
                warn!(path = %path.display(), offset = valid_len, "undecodable WAL commit: {e}");
                break;
            }
        }
        valid_len += payload.len() as u64 + FRAME_OVERHEAD;
    }

    Ok((commits, valid_len))
}

/// Append-only log of commits, one frame each:
/// `[u32 le: payload len][bincode Commit][u32 le: crc32 of payload]`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Read back every intact commit, cut off whatever follows the last one,
    /// and open the log for appends. Without the cut, new frames would land
    /// behind a damaged one and be lost on the next start.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            warn!(
                path = %path.display(),
                kept = valid_len,
                dropped = meta.len() - valid_len,
                "truncating damaged WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, commits))
    }

    /// Every intact commit from the head of the file. Stops at the first
    /// torn or corrupt frame.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        scan(path).map(|(commits, _)| commits)
    }

    /// Buffer a commit; it is durable only after `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        write_frame(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// First compaction step: write the snapshot beside the log and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for commit in commits {
            write_frame(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second compaction step: move the snapshot over the log and append to it
    /// from now on.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        *self = Self::open(&self.path.clone())?;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shiftbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn at() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 10)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap())
    }

    fn position_commit(id: DbId, name: &str) -> Commit {
        Commit {
            at: at(),
            actor: None,
            events: vec![Event::PositionSaved {
                position: Position {
                    id,
                    name: name.into(),
                },
            }],
        }
    }

    fn rules_commit(shift_id: DbId, required: u32) -> Commit {
        Commit {
            at: at(),
            actor: Some(1),
            events: vec![Event::RulesReplaced {
                shift_id,
                rules: vec![PositionRule {
                    shift_id,
                    position_id: 1,
                    allowed: true,
                    required_count: Some(required),
                }],
            }],
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn commits_come_back_in_order() {
        let path = wal_path("in_order.wal");
        let commits = vec![position_commit(1, "Cashier"), rules_commit(10, 2)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }

    #[test]
    fn missing_file_recovers_empty() {
        let path = wal_path("missing.wal");
        let (wal, commits) = Wal::recover(&path).unwrap();
        assert!(commits.is_empty());
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(path.exists());
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = wal_path("torn_tail.wal");
        let first = position_commit(1, "Cashier");
        Wal::open(&path).unwrap().append(&first).unwrap();
        let intact_len = fs::metadata(&path).unwrap().len();
        // A length prefix promising more bytes than follow.
        append_raw(&path, &[40, 0, 0, 0, 1, 2]);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        let later = position_commit(2, "Cook");
        {
            let (mut wal, commits) = Wal::recover(&path).unwrap();
            assert_eq!(commits, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn bad_checksum_ends_replay_and_is_cut() {
        let path = wal_path("bad_checksum.wal");
        let good = position_commit(1, "Cashier");
        Wal::open(&path).unwrap().append(&good).unwrap();

        let payload = bincode::serialize(&position_commit(2, "Baker")).unwrap();
        append_raw(&path, &(payload.len() as u32).to_le_bytes());
        append_raw(&path, &payload);
        append_raw(&path, &0xDEADBEEFu32.to_le_bytes());
        Wal::open(&path).unwrap().append(&position_commit(3, "Stocker")).unwrap();

        // Frames behind the damaged one are unreachable until recovery cuts it.
        assert_eq!(Wal::replay(&path).unwrap(), vec![good.clone()]);
        let (mut wal, _) = Wal::recover(&path).unwrap();
        let after = position_commit(4, "Host");
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![good, after]);
    }

    #[test]
    fn absurd_length_prefix_is_corruption() {
        let path = wal_path("absurd_len.wal");
        let good = position_commit(1, "Cashier");
        Wal::open(&path).unwrap().append(&good).unwrap();
        append_raw(&path, &u32::MAX.to_le_bytes());
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_keeps_appending() {
        let path = wal_path("compaction.wal");
        let churn: Vec<Commit> = (1..=20).map(|n| rules_commit(10, n)).collect();
        let snapshot = vec![rules_commit(10, 20)];
        let later = position_commit(5, "Manager");
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &churn {
                wal.append(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 20);
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert!(!Wal::compact_path(&path).exists());

            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
    }

    #[test]
    fn buffered_commits_need_flush_sync() {
        let path = wal_path("buffered.wal");
        let commits: Vec<Commit> = (1..=5).map(|id| position_commit(id, "Clerk")).collect();
        let mut wal = Wal::open(&path).unwrap();
        for c in &commits {
            wal.append_buffered(c).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }
}
