//! Token 估算与按预算截断
//!
//! 不依赖具体 tokenizer：英文约 4 字符/token，中文约 1.5 字符/token。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量；空文本为 0
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let (ascii, non_ascii) = text.chars().fold((0usize, 0usize), |(a, n), c| {
            if c.is_ascii() {
                (a + 1, n)
            } else {
                (a, n + 1)
            }
        });
        let tokens = ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 将文本截断到指定 token 数以内，保留开头部分
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
        let estimated = Self::estimate(text);
        if estimated <= max_tokens {
            return text.to_string();
        }
        if max_tokens == 0 {
            return String::new();
        }

        // 按比例截断，留 10% 余量给截断标记
        let ratio = max_tokens as f64 / estimated as f64;
        let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
        let truncated: String = text.chars().take(target_chars).collect();
        let marked = format!("{}...\n[truncated]", truncated.trim_end());

        if Self::estimate(&marked) <= max_tokens {
            marked
        } else {
            truncated
        }
    }
}

/// 压缩率：1 - compressed/original；未压缩或原始为空时为 0，结果夹在 [0, 1]
pub fn compression_ratio(original: usize, compressed: usize) -> f32 {
    if original == 0 || compressed >= original {
        return 0.0;
    }
    (1.0 - compressed as f64 / original as f64).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
        assert_eq!(TokenEstimator::estimate(""), 0);
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "你好世界，这是一个测试。";
        assert_eq!(TokenEstimator::estimate(text), 8);
    }

    #[test]
    fn test_truncate_respects_budget() {
        let text = "word ".repeat(400);
        let out = TokenEstimator::truncate_to_tokens(&text, 50);
        assert!(TokenEstimator::estimate(&out) <= 50);
        assert!(text.starts_with(out.trim_end_matches("...\n[truncated]").trim_end()));
        assert_eq!(TokenEstimator::truncate_to_tokens("short", 50), "short");
    }

    #[test]
    fn test_compression_ratio_bounds() {
        assert_eq!(compression_ratio(0, 0), 0.0);
        assert_eq!(compression_ratio(100, 100), 0.0);
        assert_eq!(compression_ratio(100, 120), 0.0);
        assert!((compression_ratio(100, 25) - 0.75).abs() < 1e-6);
        assert_eq!(compression_ratio(100, 0), 1.0);
    }
}
