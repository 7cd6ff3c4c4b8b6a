pub mod hellaswag;
pub mod loader;
pub mod shards;
pub mod tokenizer;

pub use hellaswag::{load_examples, render_example, HellaSwagExample, RenderedExample};
pub use loader::ShardedLoader;
pub use shards::{list_shards, load_tokens, prepare_shards, write_bin_shard, write_shard, Split};
pub use tokenizer::{Gpt2Tokenizer, TextCodec};
