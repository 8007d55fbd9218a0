use humansize::{DECIMAL, format_size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAmount {
    Percent(u8),
    Bytes { done: u64, total: u64 },
}

/// One progress update of a push or pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// File currently being transferred
    pub label: String,
    pub amount: ProgressAmount,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        match self.amount {
            ProgressAmount::Percent(p) => p.min(100),
            ProgressAmount::Bytes { total: 0, .. } => 100,
            ProgressAmount::Bytes { done, total } => ((done.min(total) * 100) / total) as u8,
        }
    }

    /// Short human readable amount, e.g. `42%` or `1.20 MB / 3 MB`
    pub fn amount_text(&self) -> String {
        match self.amount {
            ProgressAmount::Percent(p) => format!("{p}%"),
            ProgressAmount::Bytes { done, total } => {
                format!("{} / {}", format_size(done, DECIMAL), format_size(total, DECIMAL))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_from_bytes() {
        let progress = TransferProgress {
            label: "a.bin".into(),
            amount: ProgressAmount::Bytes { done: 250, total: 1000 },
        };
        assert_eq!(progress.percent(), 25);
        let empty =
            TransferProgress { label: "e".into(), amount: ProgressAmount::Bytes { done: 0, total: 0 } };
        assert_eq!(empty.percent(), 100);
        assert_eq!(
            TransferProgress { label: "x".into(), amount: ProgressAmount::Percent(42) }.amount_text(),
            "42%"
        );
    }
}
