use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// One line of a corpus, without its line terminator.
pub struct RawLine<'a> {
    pub text: &'a str,
    /// False only for a final line that has no newline.
    pub terminated: bool,
}

fn read_raw_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, text: &mut String) -> std::io::Result<usize> {
    buf.clear();
    let count = reader.read_until(b'\n', buf)?;
    text.clear();
    text.push_str(&String::from_utf8_lossy(buf));
    Ok(count)
}

fn split_terminator(text: &str) -> RawLine<'_> {
    RawLine {
        text: text.trim_end_matches(['\n', '\r']),
        terminated: text.ends_with('\n'),
    }
}

/// Call `f` on every line of the file at `path`, once, stopping at the first
/// error.
pub fn for_each_line(path: &Path, mut f: impl FnMut(RawLine<'_>) -> Result<()>) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("error opening training file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![];
    let mut text = String::new();
    while read_raw_line(&mut reader, &mut buf, &mut text)
        .with_context(|| format!("error reading training file {}", path.display()))?
        > 0
    {
        f(split_terminator(&text))?;
    }
    Ok(())
}

/// An open training file, read one line at a time. Reaching the end of the
/// file rewinds to the start, so a stream can be read for any number of
/// epochs.
pub struct CorpusStream {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    text: String,
}

impl CorpusStream {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("error opening training file {}", path.display()))?;
        Ok(CorpusStream {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            buf: vec![],
            text: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next line, wrapping around at end of file.
    pub fn next_line(&mut self) -> Result<RawLine<'_>> {
        if self.read()? == 0 {
            self.reader
                .seek(SeekFrom::Start(0))
                .with_context(|| format!("error rewinding {}", self.path.display()))?;
            if self.read()? == 0 {
                bail!("training file {} is empty", self.path.display());
            }
        }
        Ok(split_terminator(&self.text))
    }

    fn read(&mut self) -> Result<usize> {
        read_raw_line(&mut self.reader, &mut self.buf, &mut self.text)
            .with_context(|| format!("error reading training file {}", self.path.display()))
    }

    /// Skip `n` lines, wrapping around as needed.
    pub fn skip_lines(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            self.next_line()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn corpus(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn wraps_around_at_end_of_file() {
        let f = corpus("one\ntwo\r\nthree");
        let mut stream = CorpusStream::open(f.path()).unwrap();
        let mut seen = vec![];
        for _ in 0..5 {
            let line = stream.next_line().unwrap();
            seen.push((line.text.to_string(), line.terminated));
        }
        assert_eq!(
            seen,
            vec![
                ("one".to_string(), true),
                ("two".to_string(), true),
                ("three".to_string(), false),
                ("one".to_string(), true),
                ("two".to_string(), true),
            ]
        );
    }

    #[test]
    fn skip_lines_offsets_the_stream() {
        let f = corpus("a\nb\nc\n");
        let mut stream = CorpusStream::open(f.path()).unwrap();
        stream.skip_lines(4).unwrap();
        assert_eq!(stream.next_line().unwrap().text, "b");
    }

    #[test]
    fn for_each_line_reads_once() {
        let f = corpus("a b\n\nc");
        let mut lines = vec![];
        for_each_line(f.path(), |line| {
            lines.push((line.text.to_string(), line.terminated));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            lines,
            vec![
                ("a b".to_string(), true),
                ("".to_string(), true),
                ("c".to_string(), false),
            ]
        );
    }

    #[test]
    fn empty_file_is_an_error() {
        let f = corpus("");
        let mut stream = CorpusStream::open(f.path()).unwrap();
        assert!(stream.next_line().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CorpusStream::open(&dir.path().join("nope.txt"))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("error opening training file"));
    }
}
