use tera::Tera;

/// Render a one-off string template against the given context.
///
/// Rendering is best-effort: a template that fails to parse or execute
/// returns its raw text unchanged, so a bad template can never abort a
/// step.
pub fn render_or_raw(template: &str, context: &tera::Context) -> String {
    match Tera::one_off(template, context, false) {
        Ok(rendered) => rendered,
        Err(_) => template.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tera::Context;

    #[test]
    fn renders_simple_substitution() {
        let mut ctx = Context::new();
        ctx.insert("name", "World");
        assert_eq!(render_or_raw("Hello, {{ name }}!", &ctx), "Hello, World!");
    }

    #[test]
    fn renders_loops() {
        let mut ctx = Context::new();
        ctx.insert("items", &vec!["alpha", "beta"]);
        let result = render_or_raw("{% for item in items %}- {{ item }}\n{% endfor %}", &ctx);
        assert_eq!(result, "- alpha\n- beta\n");
    }

    #[test]
    fn parse_error_returns_raw_text() {
        let ctx = Context::new();
        let broken = "{% for x in %} nope";
        assert_eq!(render_or_raw(broken, &ctx), broken);
    }

    #[test]
    fn missing_variable_returns_raw_text() {
        let ctx = Context::new();
        let template = "value is {{ missing }}";
        assert_eq!(render_or_raw(template, &ctx), template);
    }

    #[test]
    fn plain_text_passes_through() {
        let ctx = Context::new();
        assert_eq!(render_or_raw("no templating here", &ctx), "no templating here");
    }
}
