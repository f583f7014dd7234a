use crate::config::PipelineConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkingConfig {
    /// Rejects `chunk_size <= chunk_overlap` up front; such a window would never advance.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size,
                chunk_overlap,
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Number of windows produced for a text of `char_len` characters.
    pub fn expected_chunks(&self, char_len: usize) -> usize {
        if char_len == 0 {
            return 0;
        }
        char_len
            .saturating_sub(self.chunk_overlap)
            .div_ceil(self.step())
            .max(1)
    }
}

impl TryFrom<&PipelineConfig> for ChunkingConfig {
    type Error = ConfigError;

    fn try_from(value: &PipelineConfig) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// One window of the source text. `start` is a character offset into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub start: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.windows(text).into_iter().map(|window| window.text).collect()
    }

    /// Sliding character window: every chunk but the last holds exactly `chunk_size`
    /// characters and consecutive chunks share exactly `chunk_overlap` characters.
    /// Stops at the first window that reaches the end of the text.
    pub fn windows(&self, text: &str) -> Vec<TextWindow> {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_len = boundaries.len() - 1;

        let mut windows = Vec::with_capacity(self.config.expected_chunks(char_len));
        let mut start = 0;
        while start < char_len {
            let end = (start + self.config.chunk_size).min(char_len);
            windows.push(TextWindow {
                start,
                text: text[boundaries[start]..boundaries[end]].to_string(),
            });
            if end == char_len {
                break;
            }
            start += self.config.step();
        }

        windows
    }
}
