use boa_ast::scope::Scope;
use boa_ast::Script;
use boa_interner::Interner;
use boa_parser::{Parser, Source};
use tracing::debug;

pub(crate) struct ParsedScript {
    pub script: Script,
    pub interner: Interner,
}

pub(crate) fn parse_script(code: &str) -> Option<ParsedScript> {
    let mut interner = Interner::default();
    let mut parser = Parser::new(Source::from_bytes(code));
    let scope = Scope::new_global();
    match parser.parse_script(&scope, &mut interner) {
        Ok(script) => Some(ParsedScript { script, interner }),
        Err(err) => {
            debug!(error = %err, "script did not parse, using lexical heuristics");
            None
        }
    }
}
