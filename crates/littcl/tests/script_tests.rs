use littcl::{Error, Interp};
use pretty_assertions::assert_eq;

fn eval(interp: &mut Interp, src: &str) -> String {
    interp.eval(src).unwrap().as_string().to_string()
}

fn eval_err(interp: &mut Interp, src: &str) -> String {
    match interp.eval(src) {
        Ok(v) => panic!("expected error, got {:?}", v),
        Err(e) => e.to_string(),
    }
}

#[test]
fn test_set_incr_read() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "set x 5; incr x; set x"), "6");
}

#[test]
fn test_proc_default_arguments() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc f {a {b 10}} { expr {$a+$b} }");
    assert_eq!(eval(&mut interp, "f 3"), "13");
    assert_eq!(eval(&mut interp, "f 3 4"), "7");
    assert_eq!(eval_err(&mut interp, "f"), "wrong # args: should be \"f a ?b?\"");
}

#[test]
fn test_proc_rest_arguments() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc v {a args} { list $a $args }");
    assert_eq!(eval(&mut interp, "v 1 2 3"), "1 {2 3}");
    assert_eq!(eval(&mut interp, "v 1"), "1 {}");
}

#[test]
fn test_proc_args_rejected_after_required() {
    let mut interp = Interp::new();
    // A required parameter after an optional is right-required; `args` may
    // not follow it.
    let err = eval_err(&mut interp, "proc f {a {b 1} c args} { list $a $b $c $args }");
    assert_eq!(err, "procedure has \"args\" after required arguments");
    // The same list without the trailing rest parameter stays legal.
    eval(&mut interp, "proc g {a {b 1} c} { list $a $b $c }");
    assert_eq!(eval(&mut interp, "g 1 2 3"), "1 2 3");
    assert_eq!(eval(&mut interp, "g 1 3"), "1 1 3");
    // And `args` before a right-required parameter is still accepted.
    eval(&mut interp, "proc h {a args z} { list $a $args $z }");
    assert_eq!(eval(&mut interp, "h 1 2 3 4"), "1 {2 3} 4");
    assert_eq!(eval(&mut interp, "h 1 4"), "1 {} 4");
}

#[test]
fn test_proc_statics() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc counter {} {{count 0}} { incr count }");
    assert_eq!(eval(&mut interp, "counter"), "1");
    assert_eq!(eval(&mut interp, "counter"), "2");
    assert_eq!(eval(&mut interp, "counter"), "3");
}

#[test]
fn test_references_and_collection() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "set r [ref hello T]; getref $r"), "hello");
    let token = eval(&mut interp, "set r");
    assert_eq!(token.len(), littcl::REFERENCE_SPACE);
    eval(&mut interp, "unset r");
    interp.eval("set cleanup done").unwrap();
    assert!(interp.eval("collect").unwrap().as_string().parse::<i64>().unwrap() >= 1);
    let err = eval_err(&mut interp, &format!("getref {{{}}}", token));
    assert!(err.contains("invalid reference id"), "got: {}", err);
}

#[test]
fn test_setref_and_finalize_surface() {
    let mut interp = Interp::new();
    eval(&mut interp, "set r [ref a TAG]");
    assert_eq!(eval(&mut interp, "setref $r b"), "b");
    assert_eq!(eval(&mut interp, "getref $r"), "b");
    assert_eq!(eval(&mut interp, "finalize $r"), "");
    eval(&mut interp, "proc fin {ref val} {}");
    assert_eq!(eval(&mut interp, "finalize $r fin"), "fin");
}

#[test]
fn test_short_circuit_command_substitution() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "expr {0 && [error boom]}"), "0");
    eval(&mut interp, "set code [catch {expr {1 && [error boom]}} msg]");
    assert_eq!(eval(&mut interp, "set code"), "1");
    assert_eq!(eval(&mut interp, "set msg"), "boom");
}

#[test]
fn test_while_loop_counts() {
    let mut interp = Interp::new();
    eval(&mut interp, "set i 0; while {$i < 3} { incr i }");
    assert_eq!(eval(&mut interp, "set i"), "3");
    assert_eq!(eval(&mut interp, "info stacktrace"), "");
}

#[test]
fn test_catch_return_options() {
    let mut interp = Interp::new();
    let code = eval(
        &mut interp,
        "catch { return -code error -errorinfo custom msg } r opts",
    );
    assert_eq!(code, "2");
    assert_eq!(eval(&mut interp, "set r"), "msg");
    assert_eq!(eval(&mut interp, "dict get $opts -code"), "1");
    assert_eq!(eval(&mut interp, "dict get $opts -level"), "1");
    assert_eq!(eval(&mut interp, "dict get $opts -errorinfo"), "custom");
}

#[test]
fn test_catch_error() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "catch { error foo }"), "1");
    eval(&mut interp, "catch { error foo } msg");
    assert_eq!(eval(&mut interp, "set msg"), "foo");
}

#[test]
fn test_return_code_break_exits_loop() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc stop {} { return -code break }");
    eval(&mut interp, "set x 0; while {$x < 10} { incr x; stop }");
    assert_eq!(eval(&mut interp, "set x"), "1");
}

#[test]
fn test_unset_nocomplain() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "unset -nocomplain missing"), "");
    let err = eval_err(&mut interp, "unset missing");
    assert_eq!(err, "can't unset \"missing\": no such variable");
}

#[test]
fn test_incr_creates_missing_variable() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "incr x"), "1");
    assert_eq!(eval(&mut interp, "set x"), "1");
    assert_eq!(eval(&mut interp, "incr y 5"), "5");
}

#[test]
fn test_foreach_multiple_vars_pads_with_empty() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "set acc {}; foreach {a b} {1 2 3 4 5} { lappend acc $a,$b }",
    );
    assert_eq!(eval(&mut interp, "set acc"), "1,2 3,4 5,");
}

#[test]
fn test_foreach_parallel_lists() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "set acc {}; foreach a {1 2} b {x y z} { lappend acc $a$b }",
    );
    assert_eq!(eval(&mut interp, "set acc"), "1x 2y z");
}

#[test]
fn test_string_range_end_relative() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "string range \"abcde\" 1 end-1"), "bcd");
}

#[test]
fn test_lsort_integer() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "lsort -integer {10 2 1}"), "1 2 10");
}

#[test]
fn test_expr_commutes_and_inf() {
    let mut interp = Interp::new();
    for (a, b) in [(1i64, 2), (-5, 9), (1 << 40, 77)] {
        eval(&mut interp, &format!("set a {}; set b {}", a, b));
        assert_eq!(
            eval(&mut interp, "expr {$a+$b}"),
            eval(&mut interp, "expr {$b+$a}")
        );
    }
    assert_eq!(eval(&mut interp, "expr {1/0.0}"), "Inf");
}

#[test]
fn test_split_join_round_trip() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "split [join {a b c} \" \"] \" \""), "a b c");
    assert_eq!(eval(&mut interp, "llength {a {b c} d}"), "3");
}

#[test]
fn test_dict_round_trip() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "dict get [dict create k v] k"), "v");
}

#[test]
fn test_copy_on_write_for_shared_lists() {
    let mut interp = Interp::new();
    eval(&mut interp, "set a {1 2}; set b $a; lappend a 3");
    assert_eq!(eval(&mut interp, "set a"), "1 2 3");
    assert_eq!(eval(&mut interp, "set b"), "1 2");
}

#[test]
fn test_dict_sugar_variables() {
    let mut interp = Interp::new();
    eval(&mut interp, "set d(k) 5");
    assert_eq!(eval(&mut interp, "set d(k)"), "5");
    assert_eq!(eval(&mut interp, "expr {$d(k) + 1}"), "6");
    eval(&mut interp, "set key k");
    assert_eq!(eval(&mut interp, "set d($key)"), "5");
    let err = eval_err(&mut interp, "set d(missing)");
    assert_eq!(err, "can't read \"d(missing)\": no such element in array");
}

#[test]
fn test_upvar_and_global() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc setter {name val} { upvar $name v; set v $val }");
    eval(&mut interp, "setter x 42");
    assert_eq!(eval(&mut interp, "set x"), "42");

    eval(&mut interp, "set g 1; proc bump {} { global g; global g; incr g }");
    eval(&mut interp, "bump");
    assert_eq!(eval(&mut interp, "set g"), "2");
}

#[test]
fn test_upvar_through_two_levels() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "proc inner {} { upvar 2 top t; set t inner-wrote }\n\
         proc middle {} { inner }\n\
         set top {}; middle",
    );
    assert_eq!(eval(&mut interp, "set top"), "inner-wrote");
}

#[test]
fn test_uplevel_runs_in_caller_scope() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc helper {} { uplevel {incr local} }");
    eval(&mut interp, "proc outer {} { set local 5; helper; set local }");
    assert_eq!(eval(&mut interp, "outer"), "6");
}

#[test]
fn test_switch_modes() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "switch b {a {set r 1} b {set r 2}}"), "2");
    assert_eq!(
        eval(&mut interp, "switch -glob foo.c {*.h {set r h} *.c {set r c}}"),
        "c"
    );
    assert_eq!(
        eval(&mut interp, "switch zzz {a {set r 1} default {set r dflt}}"),
        "dflt"
    );
    assert_eq!(eval(&mut interp, "switch x {y {set r 1}}"), "");
    // "-" bodies fall through.
    assert_eq!(eval(&mut interp, "switch a {a - b {set r shared}}"), "shared");
    assert_eq!(
        eval(&mut interp, "switch -regexp ab12 {{^[a-z]+[0-9]+$} {set r ok}}"),
        "ok"
    );
}

#[test]
fn test_subst_flags_and_control_flow() {
    let mut interp = Interp::new();
    eval(&mut interp, "set x 1");
    assert_eq!(eval(&mut interp, "subst {a $x b}"), "a 1 b");
    assert_eq!(eval(&mut interp, "subst -novariables {a $x b}"), "a $x b");
    assert_eq!(eval(&mut interp, "subst -nocommands {a [set x] b}"), "a [set x] b");
    assert_eq!(eval(&mut interp, r"subst -nobackslashes {a\tb}"), r"a\tb");
    assert_eq!(eval(&mut interp, r"subst {a\tb}"), "a\tb");
    // break ends the substitution early; continue skips one contribution.
    assert_eq!(eval(&mut interp, "subst {a[break]b}"), "a");
    assert_eq!(eval(&mut interp, "subst {a[continue]b}"), "ab");
    assert_eq!(eval(&mut interp, "subst {a[return r]b}"), "arb");
}

#[test]
fn test_expansion_argument() {
    let mut interp = Interp::new();
    eval(&mut interp, "set xs {1 2 3}");
    assert_eq!(eval(&mut interp, "list a {*}$xs b"), "a 1 2 3 b");
    assert_eq!(eval(&mut interp, "list {expand}$xs"), "1 2 3");
    assert_eq!(eval(&mut interp, "llength [list {*}{}]"), "0");
}

#[test]
fn test_tailcall() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc a {} { tailcall b done }");
    eval(&mut interp, "proc b {x} { return $x }");
    assert_eq!(eval(&mut interp, "a"), "done");
}

#[test]
fn test_eval_and_concat() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "eval list a b"), "a b");
    assert_eq!(eval(&mut interp, "eval {set q 9}"), "9");
    assert_eq!(eval(&mut interp, "concat {a b}  {c}"), "a b c");
}

#[test]
fn test_expr_command_concatenates_arguments() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "expr 1 + 2"), "3");
    assert_eq!(eval(&mut interp, "expr {1 + 2}"), "3");
}

#[test]
fn test_error_messages() {
    let mut interp = Interp::new();
    assert_eq!(
        eval_err(&mut interp, "nosuchcommand"),
        "invalid command name \"nosuchcommand\""
    );
    assert_eq!(
        eval_err(&mut interp, "set nope"),
        "can't read \"nope\": no such variable"
    );
    assert_eq!(
        eval_err(&mut interp, "lindex {a} bogus"),
        "bad index \"bogus\": must be integer?[+-]integer? or end?[+-]integer?"
    );
}

#[test]
fn test_stack_trace_records_proc_chain() {
    let mut interp = Interp::new();
    interp
        .eval("proc inner {} { error boom }\nproc outer {} { inner }")
        .unwrap();
    let err = interp.eval("outer").unwrap_err();
    match err {
        Error::Script {
            message,
            stack_trace,
        } => {
            assert_eq!(message, "boom");
            assert!(!stack_trace.is_empty());
            let procs: Vec<&str> = stack_trace.iter().map(|(p, _, _)| p.as_str()).collect();
            assert!(procs.contains(&"inner"), "trace: {:?}", procs);
        }
        other => panic!("expected script error, got {:?}", other),
    }
}

#[test]
fn test_info_surface() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc f {a b} { list $a $b }");
    assert_eq!(eval(&mut interp, "info args f"), "a b");
    assert_eq!(eval(&mut interp, "info body f"), " list $a $b ");
    assert_eq!(eval(&mut interp, "info exists f"), "0");
    eval(&mut interp, "set v 1");
    assert_eq!(eval(&mut interp, "info exists v"), "1");
    assert_eq!(eval(&mut interp, "info complete {set x 1}"), "1");
    assert_eq!(eval(&mut interp, "info complete \"set x \\{1\""), "0");
    assert_eq!(eval(&mut interp, "info level"), "0");
    eval(&mut interp, "proc depth {} { info level }");
    assert_eq!(eval(&mut interp, "depth"), "1");
    assert_eq!(eval(&mut interp, "lsearch [info commands] set") != "-1", true);
    assert_eq!(eval(&mut interp, "lsearch [info procs] f") != "-1", true);
    assert!(eval(&mut interp, "info returncodes").contains("1 error"));
    eval(&mut interp, "proc args3 {a b c} { info level 1 }");
    assert_eq!(eval(&mut interp, "args3 x y z"), "args3 x y z");
}

#[test]
fn test_exit_reaches_host() {
    let mut interp = Interp::new();
    match interp.eval("exit 3") {
        Err(Error::Exit(3)) => {}
        other => panic!("expected Exit(3), got {:?}", other),
    }
}

#[test]
fn test_capture_output() {
    let mut interp = Interp::new();
    let out = interp
        .capture("puts one; puts -nonewline tw; puts o; expr {6*7}")
        .unwrap();
    assert_eq!(out.output, vec!["one", "two"]);
    assert_eq!(&*out.value.as_string(), "42");
}

#[test]
fn test_collect_twice_sweeps_once() {
    let mut interp = Interp::new();
    eval(&mut interp, "set r [ref x T]; unset r; set clear {}");
    let first: i64 = eval(&mut interp, "collect").parse().unwrap();
    assert_eq!(first, 1);
    assert_eq!(eval(&mut interp, "collect"), "0");
}

#[test]
fn test_finalizer_invoked_from_script() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "set log {}\n\
         proc note {ref val} { lappend ::log $val }\n\
         set r [ref payload TAG note]\n\
         unset r; set clear {}",
    );
    assert_eq!(eval(&mut interp, "collect"), "1");
    assert_eq!(eval(&mut interp, "set log"), "payload");
}

#[test]
fn test_nested_loops_and_break() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "set total 0\n\
         for {set i 0} {$i < 5} {incr i} {\n\
             if {$i == 3} { break }\n\
             foreach j {1 2} { incr total }\n\
         }",
    );
    assert_eq!(eval(&mut interp, "set total"), "6");
}

#[test]
fn test_recursion_with_procs() {
    let mut interp = Interp::new();
    eval(
        &mut interp,
        "proc fib {n} { if {$n < 2} { return $n }; expr {[fib [expr {$n-1}]] + [fib [expr {$n-2}]]} }",
    );
    assert_eq!(eval(&mut interp, "fib 10"), "55");
}

#[test]
fn test_rename_and_delete_command() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc hi {} { return hello }");
    eval(&mut interp, "rename hi greet");
    assert_eq!(eval(&mut interp, "greet"), "hello");
    assert!(eval_err(&mut interp, "hi").contains("invalid command name"));
    eval(&mut interp, "rename greet {}");
    assert!(eval_err(&mut interp, "greet").contains("invalid command name"));
}

#[test]
fn test_command_cache_survives_epoch_bump() {
    let mut interp = Interp::new();
    eval(&mut interp, "proc f {} { return one }");
    assert_eq!(eval(&mut interp, "set r {}; foreach i {1 2} { lappend r [f] }; set r"), "one one");
    // Redefining inside the loop re-executes the same cached command token;
    // the epoch bump must defeat the stale resolution.
    eval(
        &mut interp,
        "proc g {} { return first }\n\
         set out {}\n\
         foreach i {1 2} {\n\
             lappend out [g]\n\
             proc g {} { return second }\n\
         }",
    );
    assert_eq!(eval(&mut interp, "set out"), "first second");
}

#[test]
fn test_source_reads_file() {
    let mut interp = Interp::new();
    let dir = std::env::temp_dir();
    let path = dir.join("littcl_source_test.tcl");
    std::fs::write(&path, "set from_file 99\n").unwrap();
    eval(&mut interp, &format!("source {{{}}}", path.display()));
    assert_eq!(eval(&mut interp, "set from_file"), "99");
    let _ = std::fs::remove_file(&path);
    let err = eval_err(&mut interp, "source /no/such/littcl/file");
    assert!(err.contains("couldn't read file"));
}

#[test]
fn test_range_and_seeded_rand() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "range 5"), "0 1 2 3 4");
    assert_eq!(eval(&mut interp, "range 2 5"), "2 3 4");
    assert_eq!(eval(&mut interp, "range 10 0 -3"), "10 7 4 1");
    interp.seed_random(42);
    let a = eval(&mut interp, "rand 100");
    let n: i64 = a.parse().unwrap();
    assert!((0..100).contains(&n));
    interp.seed_random(42);
    assert_eq!(eval(&mut interp, "rand 100"), a);
}

#[test]
fn test_time_reports_microseconds() {
    let mut interp = Interp::new();
    let out = eval(&mut interp, "time {set x 1} 10");
    assert!(out.ends_with("microseconds per iteration"), "got: {}", out);
}

#[test]
fn test_env_default() {
    let mut interp = Interp::new();
    assert_eq!(
        eval(&mut interp, "env LITTCL_NOT_SET_FOR_SURE fallback"),
        "fallback"
    );
    assert!(eval_err(&mut interp, "env LITTCL_NOT_SET_FOR_SURE").contains("does not exist"));
}

#[test]
fn test_nested_command_substitution() {
    let mut interp = Interp::new();
    assert_eq!(
        eval(&mut interp, "set x [lindex [list a [list b c]] 1]"),
        "b c"
    );
    assert_eq!(eval(&mut interp, "string length [set x]"), "3");
}

#[test]
fn test_quoted_interpolation() {
    let mut interp = Interp::new();
    eval(&mut interp, "set name world");
    assert_eq!(eval(&mut interp, "set msg \"hello, $name [string length $name]\""), "hello, world 5");
}

#[test]
fn test_comments_and_semicolons() {
    let mut interp = Interp::new();
    assert_eq!(
        eval(&mut interp, "# leading comment\nset a 1; set b 2 ;# trailing\nexpr {$a + $b}"),
        "3"
    );
}

#[test]
fn test_lmap_collects_results() {
    let mut interp = Interp::new();
    assert_eq!(eval(&mut interp, "lmap x {1 2 3} { expr {$x * $x} }"), "1 4 9");
}

#[test]
fn test_deep_recursion_is_limited() {
    let mut interp = Interp::new();
    interp.set_max_nesting_depth(100);
    eval(&mut interp, "proc down {n} { down [expr {$n+1}] }");
    let err = eval_err(&mut interp, "down 0");
    assert!(err.contains("Too many nested calls"));
}
