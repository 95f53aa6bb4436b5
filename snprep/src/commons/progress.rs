#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Progress over a batch of files; a no-op without the `indicatif` feature
pub struct BatchProgress {
    #[cfg(feature = "indicatif")]
    bar: ProgressBar,
}

impl BatchProgress {
    pub fn new(len: usize, message: &str) -> Self {
        #[cfg(feature = "indicatif")]
        {
            let bar = ProgressBar::new(len as u64);
            bar.set_style(progress_style());
            bar.set_message(message.to_string());
            bar.tick();
            BatchProgress { bar }
        }
        #[cfg(not(feature = "indicatif"))]
        {
            let _ = (len, message);
            BatchProgress {}
        }
    }

    pub fn inc(&self) {
        #[cfg(feature = "indicatif")]
        self.bar.inc(1);
    }

    pub fn finish(&self, message: &str) {
        #[cfg(feature = "indicatif")]
        self.bar.finish_with_message(message.to_string());
        #[cfg(not(feature = "indicatif"))]
        let _ = message;
    }
}
