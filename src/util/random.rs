use anyhow::bail;
use rand::Rng;

/// Source of connection codes for a server's listening identity.
#[cfg_attr(test, mockall::automock)]
pub trait CodeGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Uniformly random codes of a fixed length over a given alphabet.
pub struct RandomCodeGenerator {
    alphabet: Vec<char>,
    length: usize,
}
impl RandomCodeGenerator {
    pub fn new(alphabet: &str, length: usize) -> anyhow::Result<RandomCodeGenerator> {
        let alphabet = alphabet.chars().collect::<Vec<_>>();
        if alphabet.is_empty() {
            bail!("connection code alphabet must not be empty");
        }
        if length == 0 {
            bail!("connection code length must be positive");
        }

        Ok(RandomCodeGenerator {
            alphabet,
            length,
        })
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())])
            .collect()
    }
}
