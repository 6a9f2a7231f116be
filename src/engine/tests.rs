//! Tests for the template engine

use super::*;

use maplit::{btreemap, hashmap, hashset};
use parking_lot::Mutex;
use serde_json::json;

// ============================================================================
// Helper Functions
// ============================================================================

struct Counter;

impl Object for Counter {
    fn class_name(&self) -> &str {
        "counter"
    }

    fn get_property(&self, name: &str) -> Result<Value, ObjectError> {
        match name {
            "size" => Ok(Value::Int(3)),
            _ => Err(ObjectError::Runtime(format!("No \"{}\" here", name))),
        }
    }

    fn call_method(
        &self,
        name: &str,
        args: Vec<Value>,
        output: &mut String,
    ) -> Result<Value, ObjectError> {
        match name.to_lowercase().as_str() {
            "double" => match args.first().and_then(Value::as_i64) {
                Some(n) => Ok(Value::Int(n * 2)),
                None => Err(ObjectError::Runtime("double() expects an int".to_string())),
            },
            "say" => {
                output.push_str("said");
                Ok(Value::Null)
            }
            "stop" => Err(ObjectError::Halt),
            "explode" => Err(ObjectError::Host(anyhow::anyhow!("host exploded"))),
            _ => Err(ObjectError::Runtime(format!("Unknown method {}", name))),
        }
    }
}

#[derive(Default)]
struct Returns(Mutex<Vec<(Value, Value)>>);

impl ReturnSink for Returns {
    fn store(&self, correlation: &Value, value: Value) {
        self.0.lock().push((correlation.clone(), value));
    }
}

fn policy() -> Arc<SecurityPolicy> {
    Arc::new(SecurityPolicy::new(
        ["if", "set", "for", "do", "return"],
        hashmap! { "counter".to_string() => hashset! { "double".to_string(), "Say".to_string(), "stop".to_string(), "explode".to_string() } },
        hashmap! { "counter".to_string() => hashset! { "size".to_string() } },
    ))
}

fn engine() -> Engine {
    Engine::new(EngineOptions::default(), policy())
}

fn context(input: serde_json::Value) -> BTreeMap<String, Value> {
    let counter: Arc<dyn Object> = Arc::new(Counter);
    btreemap! {
        "input".to_string() => Value::from(input),
        "counter".to_string() => Value::Object(counter),
    }
}

fn render(source: &str) -> Result<String, EngineError> {
    engine().render_str(source, context(json!({})))
}

fn render_ok(source: &str) -> String {
    render(source).expect("render should succeed")
}

fn render_with(source: &str, input: serde_json::Value) -> String {
    engine()
        .render_str(source, context(input))
        .expect("render should succeed")
}

fn runtime_message(source: &str) -> (String, usize) {
    match render(source) {
        Err(EngineError::Runtime { message, line }) => (message, line),
        other => panic!("expected runtime error, got {:?}", other.map(|_| ())),
    }
}

fn security_message(source: &str) -> (String, usize) {
    match render(source) {
        Err(EngineError::Security { message, line }) => (message, line),
        other => panic!("expected security error, got {:?}", other.map(|_| ())),
    }
}

// ============================================================================
// Parser Tests
// ============================================================================

#[test]
fn test_parse_text_only() {
    let template = Template::parse("hello {world}").unwrap();

    assert_eq!(template.nodes(), &[ast::Node::Text("hello {world}".to_string())]);
}

#[test]
fn test_parse_collects_tags_with_lines() {
    let template = Template::parse("{% set x = 1 %}\n{% if x %}\n{% do x %}\n{% endif %}").unwrap();

    assert_eq!(template.tags(), &[("set", 1), ("if", 2), ("do", 3)]);
}

#[test]
fn test_parse_collects_filters_and_functions() {
    let template = Template::parse("{{ x|upper }}\n{{ range(1, 3) }}").unwrap();

    assert_eq!(template.filters(), &[("upper".to_string(), 1)]);
    assert_eq!(template.functions(), &[("range".to_string(), 2)]);
}

#[test]
fn test_parse_unknown_tag() {
    let err = Template::parse("\n{% include 'x' %}").unwrap_err();

    assert_eq!(err.message(), Some("Unknown \"include\" tag."));
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_parse_unclosed_block_reports_opening_line() {
    let err = Template::parse("{% set a = 1 %}\n{% for x in a %}\n{{ x }}").unwrap_err();

    assert_eq!(
        err.message(),
        Some("Unexpected end of template, unclosed \"for\" block.")
    );
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_parse_unclosed_tag_at_end_of_template() {
    let err = Template::parse("{% set a = 1 %}\n{% return a + 1").unwrap_err();

    assert_eq!(
        err.message(),
        Some("Unexpected end of template, unclosed tag.")
    );
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_parse_error_names_token_and_dedupes_expectations() {
    let err = Template::parse("{% return 1 2 %}").unwrap_err();
    let message = err.message().unwrap_or_default().to_string();

    assert!(message.starts_with("Unexpected \"2\", expected "), "{}", message);
    assert!(!message.contains("kw_"), "{}", message);
    assert_eq!(message.matches("operator").count(), 1, "{}", message);
}

#[test]
fn test_parse_unexpected_end_tag() {
    let err = Template::parse("{% endif %}").unwrap_err();

    assert_eq!(err.message(), Some("Unexpected \"endif\" tag."));
}

#[test]
fn test_parse_set_count_mismatch() {
    let err = Template::parse("{% set a, b = 1 %}").unwrap_err();

    assert!(matches!(err, EngineError::Syntax { .. }));
}

#[test]
fn test_parse_unknown_test() {
    let err = Template::parse("{{ x is shiny }}").unwrap_err();

    assert_eq!(err.message(), Some("Unknown \"shiny\" test."));
}

#[test]
fn test_parse_garbage_expression_line() {
    let err = Template::parse("{% set a = 1 %}\n{% set b = %}").unwrap_err();

    assert!(matches!(err, EngineError::Syntax { line: 2, .. }));
}

#[test]
fn test_parse_precedence() {
    assert_eq!(render_ok("{{ 1 + 2 * 3 }}"), "7");
    assert_eq!(render_ok("{{ (1 + 2) * 3 }}"), "9");
    assert_eq!(render_ok("{{ 2 ** 3 ** 2 }}"), "512");
    assert_eq!(render_ok("{{ -2 ** 2 }}"), "4");
    assert_eq!(render_ok("{{ 1 + 2 ~ 3 }}"), "33");
    assert_eq!(render_ok("{{ not false and false ? 'y' : 'n' }}"), "n");
}

// ============================================================================
// Expression Tests
// ============================================================================

#[test]
fn test_literals_and_collections() {
    assert_eq!(render_ok("{{ 'a\\'b' }}"), "a'b");
    assert_eq!(render_ok("{{ \"x\\ny\" }}"), "x\ny");
    assert_eq!(render_ok("{{ 1.5 }}"), "1.5");
    assert_eq!(render_ok("{{ true }}|{{ false }}|{{ null }}"), "1||");
    assert_eq!(render_ok("{{ [1, 2][1] }}"), "2");
    assert_eq!(render_ok("{{ {a: 1, 'b': 2}.b }}"), "2");
}

#[test]
fn test_arithmetic() {
    assert_eq!(render_ok("{{ 7 / 2 }}"), "3.5");
    assert_eq!(render_ok("{{ 8 / 2 }}"), "4");
    assert_eq!(render_ok("{{ 7 // 2 }}"), "3");
    assert_eq!(render_ok("{{ -7 // 2 }}"), "-4");
    assert_eq!(render_ok("{{ 7 % 3 }}"), "1");
    assert_eq!(render_ok("{{ '3' + 4 }}"), "7");
    assert_eq!(render_ok("{{ 9223372036854775807 + 1 }}"), "9223372036854775808");
}

#[test]
fn test_division_by_zero() {
    let (message, line) = runtime_message("\n{{ 1 / 0 }}");

    assert_eq!(message, "Division by zero.");
    assert_eq!(line, 2);
}

#[test]
fn test_unsupported_operands() {
    let (message, _) = runtime_message("{{ [1] + 1 }}");

    assert_eq!(message, "Unsupported operand types: array + int");
}

#[test]
fn test_comparisons_and_containment() {
    assert_eq!(render_ok("{{ 1 < 2 ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 'b' > 'a' ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ '10' == 10 ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 2 in [1, 2] ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 3 not in [1, 2] ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 'bc' in 'abcd' ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 'abc' starts with 'ab' ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 'abc' ends with 'x' ? 'y' : 'n' }}"), "n");
}

#[test]
fn test_range_and_concat() {
    assert_eq!(render_ok("{% for i in 1..3 %}{{ i }}{% endfor %}"), "123");
    assert_eq!(render_ok("{% for i in 3..1 %}{{ i }}{% endfor %}"), "321");
    assert_eq!(render_ok("{% for c in 'a'..'c' %}{{ c }}{% endfor %}"), "abc");
    assert_eq!(render_ok("{{ 'a' ~ 1 ~ true }}"), "a11");
}

#[test]
fn test_tests() {
    assert_eq!(render_ok("{{ missing is defined ? 'y' : 'n' }}"), "n");
    assert_eq!(render_ok("{{ input is defined ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ input.nope is not defined ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ null is null ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ [] is empty ? 'y' : 'n' }}"), "y");
    assert_eq!(render_ok("{{ 0 is empty ? 'y' : 'n' }}"), "n");
    assert_eq!(render_ok("{{ 4 is even ? 'y' : 'n' }}{{ 3 is odd ? 'y' : 'n' }}"), "yy");
    assert_eq!(render_ok("{{ input is iterable ? 'y' : 'n' }}"), "y");
}

#[test]
fn test_coalesce_is_lenient() {
    assert_eq!(render_ok("{{ missing ?? 'fallback' }}"), "fallback");
    assert_eq!(render_ok("{{ input.a.b ?? 'deep' }}"), "deep");
    assert_eq!(render_with("{{ input.a ?? 'x' }}", json!({"a": "set"})), "set");
}

// ============================================================================
// Strict Variables Tests
// ============================================================================

#[test]
fn test_undefined_variable_is_an_error() {
    let (message, line) = runtime_message("line one\n\n{{ nope }}");

    assert_eq!(message, "Variable \"nope\" does not exist.");
    assert_eq!(line, 3);
}

#[test]
fn test_missing_key_lists_keys() {
    let result = engine().render_str("{{ input.z }}", context(json!({"a": 1, "b": 2})));

    match result {
        Err(EngineError::Runtime { message, .. }) => assert_eq!(
            message,
            "Key \"z\" for sequence/mapping with keys \"a, b\" does not exist."
        ),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_attribute_on_null() {
    let result = engine().render_str("{{ input.a.b }}", context(json!({"a": null})));

    assert_eq!(
        result.unwrap_err().message(),
        Some("Impossible to access an attribute (\"b\") on a null variable.")
    );
}

#[test]
fn test_lenient_mode_yields_null() {
    let options = EngineOptions {
        strict_variables: false,
        ..EngineOptions::default()
    };
    let engine = Engine::new(options, policy());

    let output = engine
        .render_str("[{{ nope }}][{{ input.a.b }}]", context(json!({})))
        .unwrap();

    assert_eq!(output, "[][]");
}

// ============================================================================
// Statement Tests
// ============================================================================

#[test]
fn test_set_multiple_targets() {
    assert_eq!(render_ok("{% set a, b = 1, 2 %}{{ a + b }}"), "3");
}

#[test]
fn test_if_elseif_else() {
    let source = "{% if input.n > 5 %}big{% elseif input.n > 1 %}mid{% else %}small{% endif %}";

    assert_eq!(render_with(source, json!({"n": 9})), "big");
    assert_eq!(render_with(source, json!({"n": 3})), "mid");
    assert_eq!(render_with(source, json!({"n": 0})), "small");
}

#[test]
fn test_for_loop_variable() {
    let source = "{% for k, v in input %}{{ loop.index }}:{{ k }}={{ v }}{% if not loop.last %},{% endif %}{% endfor %}";

    assert_eq!(render_with(source, json!({"a": 1, "b": 2})), "1:a=1,2:b=2");
}

#[test]
fn test_for_loop_keeps_insertion_order() {
    let source = "{% for k, v in input %}{{ k }}{% endfor %}|{% for k, v in {z: 1, m: 2, a: 3} %}{{ k }}{% endfor %}";

    assert_eq!(render_with(source, json!({"b": 1, "c": 2, "a": 3})), "bca|zma");
}

#[test]
fn test_for_else_on_empty() {
    assert_eq!(render_ok("{% for x in [] %}{{ x }}{% else %}none{% endfor %}"), "none");
    assert_eq!(render_ok("{% for x in null %}{{ x }}{% else %}none{% endfor %}"), "none");
}

#[test]
fn test_for_scope() {
    // Outer variables are updated, loop-local ones do not leak
    let source = "{% set total = 0 %}{% for n in [1, 2, 3] %}{% set total = total + n %}{% set tmp = n %}{% endfor %}{{ total }}{{ tmp is defined ? 'leak' : '' }}";

    assert_eq!(render_ok(source), "6");
}

#[test]
fn test_comments_are_dropped() {
    assert_eq!(render_ok("a{# hidden {{ x }} #}b"), "ab");
}

#[test]
fn test_return_stores_and_halts() {
    let returns = Arc::new(Returns::default());
    let engine = engine().with_return_sink(returns.clone());
    let mut ctx = context(json!({"x": 4}));
    ctx.insert("runId".to_string(), Value::Int(7));

    let output = engine
        .render_str("before{% return input.x + 1 %}after", ctx)
        .unwrap();

    assert_eq!(output, "before");
    assert_eq!(*returns.0.lock(), vec![(Value::Int(7), Value::Int(5))]);
}

#[test]
fn test_return_inside_loop_halts_everything() {
    let returns = Arc::new(Returns::default());
    let engine = engine().with_return_sink(returns.clone());

    let output = engine
        .render_str(
            "{% for i in 1..5 %}{{ i }}{% if i == 2 %}{% return i %}{% endif %}{% endfor %}end",
            context(json!({})),
        )
        .unwrap();

    assert_eq!(output, "12");
    assert_eq!(returns.0.lock().len(), 1);
}

// ============================================================================
// Sandbox Tests
// ============================================================================

#[test]
fn test_disallowed_tag() {
    let engine = Engine::new(
        EngineOptions::default(),
        Arc::new(SecurityPolicy::new(["if"], HashMap::new(), HashMap::new())),
    );

    let err = engine
        .render_str("{% if true %}\n{% set x = 1 %}{% endif %}", context(json!({})))
        .unwrap_err();

    assert_eq!(err.message(), Some("Tag \"set\" is not allowed."));
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_filters_and_functions_are_never_allowed() {
    assert_eq!(
        security_message("{{ 'a'|upper }}").0,
        "Filter \"upper\" is not allowed."
    );
    assert_eq!(
        security_message("\n{{ range(1, 2) }}"),
        ("Function \"range\" is not allowed.".to_string(), 2)
    );
}

#[test]
fn test_security_check_runs_before_output() {
    let (message, _) = security_message("{% do counter.say() %}{{ x|raw }}");

    assert_eq!(message, "Filter \"raw\" is not allowed.");
}

#[test]
fn test_allowed_method_call() {
    assert_eq!(render_ok("{{ counter.double(21) }}"), "42");
}

#[test]
fn test_method_names_are_case_insensitive() {
    assert_eq!(render_ok("{% do counter.SAY() %}{% do counter.say() %}"), "saidsaid");
}

#[test]
fn test_disallowed_method() {
    let (message, line) = security_message("\n\n{% do counter.reset() %}");

    assert_eq!(
        message,
        "Calling \"reset\" method on a \"counter\" object is not allowed."
    );
    assert_eq!(line, 3);
}

#[test]
fn test_property_access() {
    assert_eq!(render_ok("{{ counter.size }}"), "3");

    let (message, _) = security_message("{{ counter.secret }}");
    assert_eq!(
        message,
        "Calling \"secret\" property on a \"counter\" object is not allowed."
    );
}

#[test]
fn test_allowed_methods_can_be_replaced() {
    let engine = engine();
    engine.policy().set_allowed_methods(hashmap! {
        "counter".to_string() => hashset! { "double".to_string() },
    });

    assert!(engine
        .render_str("{% do counter.say() %}", context(json!({})))
        .is_err());
    assert_eq!(
        engine
            .render_str("{{ counter.double(2) }}", context(json!({})))
            .unwrap(),
        "4"
    );
}

#[test]
fn test_object_halt_keeps_output() {
    assert_eq!(render_ok("a{% do counter.stop() %}b"), "a");
}

#[test]
fn test_object_runtime_error_gets_line() {
    let (message, line) = runtime_message("\n{{ counter.double('x') }}");

    assert_eq!(message, "double() expects an int");
    assert_eq!(line, 2);
}

#[test]
fn test_host_error_passes_through() {
    let err = render("{% do counter.explode() %}").unwrap_err();

    match err {
        EngineError::Host(err) => assert_eq!(err.to_string(), "host exploded"),
        other => panic!("expected host error, got {:?}", other),
    }
}

#[test]
fn test_printing_object_fails() {
    let (message, _) = runtime_message("{{ counter }}");

    assert_eq!(
        message,
        "Object of class \"counter\" could not be converted to string"
    );
}

// ============================================================================
// Cache Tests
// ============================================================================

#[test]
fn test_load_caches_by_name() {
    let engine = engine();
    let first = engine.load("abc", "{{ 1 }}").unwrap();
    let second = engine.load("abc", "ignored").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(engine.cached("abc").is_some());
    assert!(engine.cached("def").is_none());
}
